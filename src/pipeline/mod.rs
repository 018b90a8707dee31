pub mod buffer;
pub mod framelist;

pub use buffer::{BufferError, BufferPool, FrameBuffer, FrameMeta};
pub use framelist::{FrameQueue, PopOutcome, QueueStats};
