use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Sensor modalities carried on the wire, in transmission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaneKind {
    Depth,
    Rgb,
    Ir,
}

impl PlaneKind {
    pub const ALL: [PlaneKind; 3] = [PlaneKind::Depth, PlaneKind::Rgb, PlaneKind::Ir];

    pub fn as_str(self) -> &'static str {
        match self {
            PlaneKind::Depth => "depth",
            PlaneKind::Rgb => "rgb",
            PlaneKind::Ir => "ir",
        }
    }
}

impl fmt::Display for PlaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One plane of a driver-native frame record.
///
/// Borrowed from the driver for the duration of the ingestion call only.
/// `data` is `None` when the driver handed over a null pointer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPlane<'a> {
    pub width: u32,
    pub height: u32,
    pub size: u32,
    pub data: Option<&'a [u8]>,
}

impl<'a> RawPlane<'a> {
    /// Plane backed by `data`, with `size` taken from the slice length.
    ///
    /// Slices longer than `u32::MAX` are clamped to what the header can describe.
    pub fn new(width: u32, height: u32, data: &'a [u8]) -> Self {
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        Self {
            width,
            height,
            size,
            data: Some(data),
        }
    }

    /// Plane from a driver pointer/size pair. A null `ptr` yields a plane without data.
    ///
    /// # Safety
    /// When `ptr` is non-null it must be valid for reads of `size` bytes for `'a`,
    /// and the memory must not be mutated while the plane is alive.
    pub unsafe fn from_raw_parts(width: u32, height: u32, size: u32, ptr: *const u8) -> Self {
        let data = if ptr.is_null() {
            None
        } else {
            Some(unsafe { std::slice::from_raw_parts(ptr, size as usize) })
        };
        Self {
            width,
            height,
            size,
            data,
        }
    }

    pub fn is_present(&self) -> bool {
        self.size > 0
    }
}

/// Driver-native frame record as delivered to the capture callback.
///
/// Only depth, RGB and IR are streamed; the remaining modalities exist so a
/// driver record can be mapped over field for field and are ignored here.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFrame<'a> {
    pub depth: RawPlane<'a>,
    pub rgb: RawPlane<'a>,
    pub ir: RawPlane<'a>,
    pub yuyv: RawPlane<'a>,
    pub mjpeg: RawPlane<'a>,
    pub peak: RawPlane<'a>,
    pub point_cloud: RawPlane<'a>,
}

impl<'a> RawFrame<'a> {
    pub fn plane(&self, kind: PlaneKind) -> &RawPlane<'a> {
        match kind {
            PlaneKind::Depth => &self.depth,
            PlaneKind::Rgb => &self.rgb,
            PlaneKind::Ir => &self.ir,
        }
    }
}

/// An owned image plane. Always non-empty; absent planes are `None` on the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub width: u32,
    pub height: u32,
    data: Bytes,
}

impl Plane {
    /// Returns `None` for an empty buffer, which the wire format treats as absent.
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Option<Self> {
        let data = data.into();
        if data.is_empty() || u32::try_from(data.len()).is_err() {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    /// Byte length of the plane as written in the header
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// A frame accepted by the server, owning copies of its planes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFrame {
    /// Microseconds since the UNIX epoch, stamped at ingestion
    pub timestamp_us: u64,
    pub frame_id: u32,
    pub depth: Option<Plane>,
    pub rgb: Option<Plane>,
    pub ir: Option<Plane>,
}

impl NormalizedFrame {
    pub fn plane(&self, kind: PlaneKind) -> Option<&Plane> {
        match kind {
            PlaneKind::Depth => self.depth.as_ref(),
            PlaneKind::Rgb => self.rgb.as_ref(),
            PlaneKind::Ir => self.ir.as_ref(),
        }
    }

    /// Present planes in wire order
    pub fn planes(&self) -> impl Iterator<Item = (PlaneKind, &Plane)> + '_ {
        PlaneKind::ALL
            .into_iter()
            .filter_map(move |kind| self.plane(kind).map(|plane| (kind, plane)))
    }

    /// Sum of present plane sizes
    pub fn payload_len(&self) -> usize {
        self.planes().map(|(_, plane)| plane.data.len()).sum()
    }
}
