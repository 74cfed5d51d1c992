pub mod frame;
pub mod synthetic;

pub use frame::{NormalizedFrame, Plane, PlaneKind, RawFrame, RawPlane};
pub use synthetic::SyntheticSource;

use crate::Result;

/// Callback-driven frame producer, the shape camera driver SDKs expose.
///
/// The callback runs on a source-owned thread and the borrowed `RawFrame`
/// is only valid until it returns.
pub trait FrameSource {
    fn start<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&RawFrame<'_>) + Send + 'static;

    fn stop(&mut self) -> Result<()>;

    fn is_streaming(&self) -> bool;
}
