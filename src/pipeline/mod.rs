pub mod fanout;
pub mod ringbuf;

pub use fanout::{FanOut, Published, Subscription};
pub use ringbuf::{BufferStats, FrameBuffer};
