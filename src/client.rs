//! Consumer side of the wire protocol.
//!
//! `FrameReader` pulls framed messages off any byte stream and rebuilds
//! `NormalizedFrame`s. Plane sizes come straight from the peer's header, so
//! each one is checked against `max_plane_bytes` before anything is allocated.

use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};

use bytes::BytesMut;
use tracing::debug;

use crate::capture::{NormalizedFrame, Plane, PlaneKind};
use crate::codec::{FrameHeader, HEADER_LEN};
use crate::error::{Error, Result};

/// Default per-plane limit: 64 MiB
pub const DEFAULT_MAX_PLANE_BYTES: u32 = 64 * 1024 * 1024;

pub struct FrameReader<R> {
    inner: R,
    max_plane_bytes: u32,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_plane_bytes: DEFAULT_MAX_PLANE_BYTES,
        }
    }

    pub fn with_max_plane_bytes(mut self, limit: u32) -> Self {
        self.max_plane_bytes = limit;
        self
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next header.
    ///
    /// `Ok(None)` when the stream ends cleanly on a message boundary; an
    /// end-of-stream inside the header is an `UnexpectedEof` error.
    pub fn read_header(&mut self) -> Result<Option<FrameHeader>> {
        let mut buf = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("stream ended after {filled} of {HEADER_LEN} header bytes"),
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let header = FrameHeader::decode(&buf);
        for kind in PlaneKind::ALL {
            let size = header.plane(kind).size;
            if size > self.max_plane_bytes {
                return Err(Error::PlaneTooLarge {
                    plane: kind,
                    size,
                    limit: self.max_plane_bytes,
                });
            }
        }
        Ok(Some(header))
    }

    /// Read the next complete frame, `Ok(None)` at a clean end of stream
    pub fn read_frame(&mut self) -> Result<Option<NormalizedFrame>> {
        let Some(header) = self.read_header()? else {
            return Ok(None);
        };

        let depth = self.read_plane(&header, PlaneKind::Depth)?;
        let rgb = self.read_plane(&header, PlaneKind::Rgb)?;
        let ir = self.read_plane(&header, PlaneKind::Ir)?;

        debug!(
            frame_id = header.frame_id,
            bytes = header.message_len(),
            "Received frame"
        );

        Ok(Some(NormalizedFrame {
            timestamp_us: header.timestamp_us,
            frame_id: header.frame_id,
            depth,
            rgb,
            ir,
        }))
    }

    fn read_plane(&mut self, header: &FrameHeader, kind: PlaneKind) -> Result<Option<Plane>> {
        let ph = header.plane(kind);
        if ph.size == 0 {
            return Ok(None);
        }
        let mut data = BytesMut::zeroed(ph.size as usize);
        self.inner.read_exact(&mut data)?;
        Ok(Plane::new(ph.width, ph.height, data.freeze()))
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<NormalizedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_frame().transpose()
    }
}

/// Connect to a frame server and wrap the stream in a reader
pub fn connect(addr: impl ToSocketAddrs) -> Result<FrameReader<TcpStream>> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    Ok(FrameReader::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::serialize;
    use std::io::Cursor;

    fn frame(id: u32, depth_len: usize, ir_len: usize) -> NormalizedFrame {
        NormalizedFrame {
            timestamp_us: 1_000 + u64::from(id),
            frame_id: id,
            depth: Plane::new(8, 8, vec![id as u8; depth_len]),
            rgb: None,
            ir: Plane::new(8, 8, vec![0xEE; ir_len]),
        }
    }

    #[test]
    fn reads_consecutive_frames_then_clean_eof() {
        let frames = [frame(1, 128, 0), frame(2, 0, 64), frame(3, 16, 16)];
        let stream: Vec<u8> = frames.iter().flat_map(serialize).collect();

        let reader = FrameReader::new(Cursor::new(stream));
        let decoded: Vec<NormalizedFrame> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn eof_inside_header_is_an_error() {
        let bytes = serialize(&frame(1, 4, 0));
        let mut reader = FrameReader::new(Cursor::new(bytes[..30].to_vec()));
        match reader.read_frame() {
            Err(Error::Io(e)) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    fn eof_inside_plane_is_an_error() {
        let bytes = serialize(&frame(1, 100, 0));
        let mut reader = FrameReader::new(Cursor::new(bytes[..HEADER_LEN + 50].to_vec()));
        match reader.read_frame() {
            Err(Error::Io(e)) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    fn oversized_plane_rejected_before_allocation() {
        let bytes = serialize(&frame(1, 2048, 0));
        let mut reader = FrameReader::new(Cursor::new(bytes)).with_max_plane_bytes(1024);
        assert!(matches!(
            reader.read_frame(),
            Err(Error::PlaneTooLarge {
                plane: PlaneKind::Depth,
                size: 2048,
                limit: 1024
            })
        ));
    }
}
