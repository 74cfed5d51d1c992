//! Frame normalization and the binary wire format.
//!
//! Every message is a fixed 48-byte header followed by the present planes:
//!
//! ```text
//! ┌───────────┬──────────┬──────────────────────┬──────────────────────┬──────────────────────┐
//! │ timestamp │ frame_id │ depth w / h / size   │ rgb w / h / size     │ ir w / h / size      │
//! │ u64       │ u32      │ 3 x u32              │ 3 x u32              │ 3 x u32              │
//! └───────────┴──────────┴──────────────────────┴──────────────────────┴──────────────────────┘
//! [depth_size bytes][rgb_size bytes][ir_size bytes]
//! ```
//!
//! All header fields use the host's native byte order; there is no magic,
//! version or checksum. Absent planes have width, height and size of zero
//! and contribute no payload bytes. A receiver must parse the header before
//! it knows the message length: `48 + depth_size + rgb_size + ir_size`.

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes};

use crate::capture::{NormalizedFrame, Plane, PlaneKind, RawFrame, RawPlane};
use crate::error::{Error, Result};

/// Size of the encoded header in bytes
pub const HEADER_LEN: usize = 48;

/// Plane dimensions as carried in the header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneHeader {
    pub width: u32,
    pub height: u32,
    pub size: u32,
}

impl From<Option<&Plane>> for PlaneHeader {
    fn from(plane: Option<&Plane>) -> Self {
        plane.map_or_else(Self::default, |p| Self {
            width: p.width,
            height: p.height,
            size: p.size(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub timestamp_us: u64,
    pub frame_id: u32,
    pub depth: PlaneHeader,
    pub rgb: PlaneHeader,
    pub ir: PlaneHeader,
}

impl FrameHeader {
    pub fn for_frame(frame: &NormalizedFrame) -> Self {
        Self {
            timestamp_us: frame.timestamp_us,
            frame_id: frame.frame_id,
            depth: frame.depth.as_ref().into(),
            rgb: frame.rgb.as_ref().into(),
            ir: frame.ir.as_ref().into(),
        }
    }

    pub fn plane(&self, kind: PlaneKind) -> &PlaneHeader {
        match kind {
            PlaneKind::Depth => &self.depth,
            PlaneKind::Rgb => &self.rgb,
            PlaneKind::Ir => &self.ir,
        }
    }

    /// Payload bytes following the header
    pub fn payload_len(&self) -> usize {
        PlaneKind::ALL
            .iter()
            .map(|&kind| self.plane(kind).size as usize)
            .sum()
    }

    /// Full message length including the header
    pub fn message_len(&self) -> usize {
        HEADER_LEN + self.payload_len()
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_u64_ne(self.timestamp_us);
        buf.put_u32_ne(self.frame_id);
        for plane in [&self.depth, &self.rgb, &self.ir] {
            buf.put_u32_ne(plane.width);
            buf.put_u32_ne(plane.height);
            buf.put_u32_ne(plane.size);
        }
        out
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut buf = &bytes[..];
        let timestamp_us = buf.get_u64_ne();
        let frame_id = buf.get_u32_ne();
        let mut plane = || PlaneHeader {
            width: buf.get_u32_ne(),
            height: buf.get_u32_ne(),
            size: buf.get_u32_ne(),
        };
        let depth = plane();
        let rgb = plane();
        let ir = plane();
        Self {
            timestamp_us,
            frame_id,
            depth,
            rgb,
            ir,
        }
    }
}

/// Assigns ingestion timestamps and frame ids
#[derive(Debug, Default)]
pub struct FrameSequencer {
    counter: AtomicU32,
}

impl FrameSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `(timestamp_us, frame_id)`; ids start at 1 and wrap
    pub fn next(&self) -> (u64, u32) {
        let id = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        (now_micros(), id)
    }

    /// Id of the most recently issued frame, 0 before the first
    pub fn last_id(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// Wall-clock time in microseconds since the UNIX epoch
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Copy the depth, RGB and IR planes of a driver frame into an owned frame.
///
/// All copying finishes before this returns, so the driver may reuse its
/// buffers as soon as the ingestion call completes. The sequencer is only
/// advanced once every plane was copied.
pub fn normalize(raw: &RawFrame<'_>, sequencer: &FrameSequencer) -> Result<NormalizedFrame> {
    let depth = copy_plane(PlaneKind::Depth, raw.plane(PlaneKind::Depth))?;
    let rgb = copy_plane(PlaneKind::Rgb, raw.plane(PlaneKind::Rgb))?;
    let ir = copy_plane(PlaneKind::Ir, raw.plane(PlaneKind::Ir))?;

    let (timestamp_us, frame_id) = sequencer.next();
    Ok(NormalizedFrame {
        timestamp_us,
        frame_id,
        depth,
        rgb,
        ir,
    })
}

fn copy_plane(kind: PlaneKind, raw: &RawPlane<'_>) -> Result<Option<Plane>> {
    if !raw.is_present() {
        return Ok(None);
    }
    let data = raw.data.ok_or(Error::MissingPlaneData {
        plane: kind,
        size: raw.size,
    })?;
    let size = raw.size as usize;
    let src = data.get(..size).ok_or(Error::TruncatedPlane {
        plane: kind,
        declared: raw.size,
        available: data.len(),
    })?;

    let mut owned = Vec::new();
    owned
        .try_reserve_exact(size)
        .map_err(|_| Error::Allocation { plane: kind, size })?;
    owned.extend_from_slice(src);

    Ok(Plane::new(raw.width, raw.height, owned))
}

/// Encode a frame into one contiguous message
pub fn serialize(frame: &NormalizedFrame) -> Vec<u8> {
    let header = FrameHeader::for_frame(frame);
    let mut out = Vec::with_capacity(header.message_len());
    out.extend_from_slice(&header.encode());
    for (_, plane) in frame.planes() {
        out.extend_from_slice(plane.data());
    }
    out
}

/// Write a frame as header then planes, returning the bytes written.
///
/// Each segment must be written completely; any failure leaves the peer
/// with a partial message and the stream must be abandoned.
pub fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    frame: &NormalizedFrame,
) -> std::io::Result<usize> {
    let header = FrameHeader::for_frame(frame);
    writer.write_all(&header.encode())?;
    for (_, plane) in frame.planes() {
        writer.write_all(plane.data())?;
    }
    Ok(header.message_len())
}

/// Parse one complete message. Trailing bytes beyond the declared length are ignored.
pub fn deserialize(bytes: &[u8]) -> Result<NormalizedFrame> {
    let header_bytes: &[u8; HEADER_LEN] = bytes
        .get(..HEADER_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(Error::TruncatedMessage {
            expected: HEADER_LEN,
            actual: bytes.len(),
        })?;
    let header = FrameHeader::decode(header_bytes);

    if bytes.len() < header.message_len() {
        return Err(Error::TruncatedMessage {
            expected: header.message_len(),
            actual: bytes.len(),
        });
    }

    let mut payload = &bytes[HEADER_LEN..];
    let mut take = |kind: PlaneKind| {
        let ph = *header.plane(kind);
        let (data, rest) = payload.split_at(ph.size as usize);
        payload = rest;
        Plane::new(ph.width, ph.height, Bytes::copy_from_slice(data))
    };
    let depth = take(PlaneKind::Depth);
    let rgb = take(PlaneKind::Rgb);
    let ir = take(PlaneKind::Ir);

    Ok(NormalizedFrame {
        timestamp_us: header.timestamp_us,
        frame_id: header.frame_id,
        depth,
        rgb,
        ir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane(width: u32, height: u32, len: usize, seed: u8) -> Option<Plane> {
        let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect();
        Plane::new(width, height, data)
    }

    #[test]
    fn header_is_48_bytes_in_field_order() {
        let header = FrameHeader {
            timestamp_us: 0x0102_0304_0506_0708,
            frame_id: 9,
            depth: PlaneHeader { width: 10, height: 11, size: 12 },
            rgb: PlaneHeader { width: 13, height: 14, size: 15 },
            ir: PlaneHeader { width: 16, height: 17, size: 18 },
        };
        let bytes = header.encode();

        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[..8], 0x0102_0304_0506_0708u64.to_ne_bytes());
        assert_eq!(bytes[8..12], 9u32.to_ne_bytes());
        assert_eq!(bytes[24..28], 12u32.to_ne_bytes());
        assert_eq!(bytes[44..48], 18u32.to_ne_bytes());
        assert_eq!(FrameHeader::decode(&bytes), header);
    }

    #[test]
    fn normalize_copies_present_planes_only() {
        let depth = vec![7u8; 100];
        let yuyv = vec![1u8; 32];
        let raw = RawFrame {
            depth: RawPlane::new(10, 5, &depth),
            yuyv: RawPlane::new(4, 4, &yuyv),
            ..RawFrame::default()
        };
        let sequencer = FrameSequencer::new();
        let frame = normalize(&raw, &sequencer).unwrap();

        assert_eq!(frame.frame_id, 1);
        assert!(frame.timestamp_us > 0);
        let d = frame.depth.as_ref().unwrap();
        assert_eq!((d.width, d.height, d.size()), (10, 5, 100));
        assert_eq!(&d.data()[..], &depth[..]);
        assert!(frame.rgb.is_none());
        assert!(frame.ir.is_none());
    }

    #[test]
    fn normalize_copies_only_declared_size() {
        let backing = vec![3u8; 64];
        let raw = RawFrame {
            ir: RawPlane {
                width: 4,
                height: 4,
                size: 16,
                data: Some(&backing),
            },
            ..RawFrame::default()
        };
        let frame = normalize(&raw, &FrameSequencer::new()).unwrap();
        assert_eq!(frame.ir.unwrap().size(), 16);
    }

    #[test]
    fn normalize_rejects_missing_or_short_data() {
        let sequencer = FrameSequencer::new();

        let null_rgb = RawFrame {
            rgb: unsafe { RawPlane::from_raw_parts(2, 2, 12, std::ptr::null()) },
            ..RawFrame::default()
        };
        assert!(matches!(
            normalize(&null_rgb, &sequencer),
            Err(Error::MissingPlaneData { plane: PlaneKind::Rgb, size: 12 })
        ));

        let short = [0u8; 4];
        let truncated = RawFrame {
            depth: RawPlane {
                width: 2,
                height: 2,
                size: 8,
                data: Some(&short),
            },
            ..RawFrame::default()
        };
        assert!(matches!(
            normalize(&truncated, &sequencer),
            Err(Error::TruncatedPlane { declared: 8, available: 4, .. })
        ));

        // Failed normalization does not consume an id
        assert_eq!(sequencer.last_id(), 0);
    }

    #[test]
    fn frame_ids_increase_from_one() {
        let sequencer = FrameSequencer::new();
        let raw = RawFrame::default();
        let ids: Vec<u32> = (0..3)
            .map(|_| normalize(&raw, &sequencer).unwrap().frame_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn depth_only_frame_is_148_bytes() {
        let frame = NormalizedFrame {
            timestamp_us: 1,
            frame_id: 1,
            depth: plane(10, 10, 100, 0),
            rgb: None,
            ir: None,
        };
        let bytes = serialize(&frame);
        assert_eq!(bytes.len(), 148);

        let header = FrameHeader::decode(bytes[..HEADER_LEN].try_into().unwrap());
        assert_eq!(header.depth.size, 100);
        assert_eq!(header.rgb, PlaneHeader::default());
        assert_eq!(header.ir, PlaneHeader::default());
    }

    #[test]
    fn serialize_then_deserialize_restores_frame() {
        let frames = [
            NormalizedFrame {
                timestamp_us: 1_723_000_000_123_456,
                frame_id: 41,
                depth: plane(4, 3, 24, 1),
                rgb: plane(4, 3, 36, 2),
                ir: plane(4, 3, 12, 3),
            },
            NormalizedFrame {
                timestamp_us: 5,
                frame_id: u32::MAX,
                depth: None,
                rgb: plane(2, 1, 6, 9),
                ir: None,
            },
            NormalizedFrame {
                timestamp_us: 0,
                frame_id: 0,
                depth: None,
                rgb: None,
                ir: None,
            },
        ];

        for frame in frames {
            let bytes = serialize(&frame);
            assert_eq!(bytes.len(), HEADER_LEN + frame.payload_len());
            assert_eq!(deserialize(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn write_frame_matches_serialize() {
        let frame = NormalizedFrame {
            timestamp_us: 99,
            frame_id: 3,
            depth: plane(2, 2, 8, 4),
            rgb: None,
            ir: plane(2, 2, 4, 5),
        };
        let mut out = Vec::new();
        let written = write_frame(&mut out, &frame).unwrap();
        assert_eq!(written, out.len());
        assert_eq!(out, serialize(&frame));
    }

    #[test]
    fn write_frame_fails_on_short_writer() {
        let frame = NormalizedFrame {
            timestamp_us: 1,
            frame_id: 1,
            depth: plane(10, 10, 100, 0),
            rgb: None,
            ir: None,
        };
        let mut backing = [0u8; 60];
        let mut sink = &mut backing[..];
        let err = write_frame(&mut sink, &frame).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WriteZero);
    }

    #[test]
    fn deserialize_rejects_truncated_messages() {
        let frame = NormalizedFrame {
            timestamp_us: 1,
            frame_id: 1,
            depth: plane(10, 10, 100, 0),
            rgb: None,
            ir: None,
        };
        let bytes = serialize(&frame);

        assert!(matches!(
            deserialize(&bytes[..20]),
            Err(Error::TruncatedMessage { expected: HEADER_LEN, actual: 20 })
        ));
        assert!(matches!(
            deserialize(&bytes[..147]),
            Err(Error::TruncatedMessage { expected: 148, actual: 147 })
        ));
    }
}
