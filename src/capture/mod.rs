//! Capture subsystem boundary
//!
//! The camera stack owns its own driver thread and delivers completed frames
//! through [`FrameSink::frame_complete`]. Everything on the consumer side of
//! that callback lives in [`crate::pipeline`] and [`crate::streamer`].

pub mod frame;
pub mod synthetic;
pub mod v4l2;

use std::sync::Arc;

use thiserror::Error;

pub use frame::{PixelFormat, RawFrame};
pub use synthetic::SyntheticSource;
pub use v4l2::V4l2Source;

use crate::CaptureConfig;

/// Capture subsystem errors
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Requested format/resolution the pipeline cannot produce. Fatal at open.
    #[error("unsupported capture configuration: {0}")]
    Unsupported(String),

    /// Device could not be opened or queried. Fatal.
    #[error("capture device error: {0}")]
    Device(String),

    /// Buffer allocation or streaming setup failed. Fatal, stream unusable.
    #[error("capture resource error: {0}")]
    Resource(String),
}

/// Receives completed frames on the subsystem's driver thread.
///
/// Implementations must not block on anything the consumer thread could be
/// waiting on; wrap-and-push only.
pub trait FrameSink: Send + Sync {
    fn frame_complete(&self, frame: RawFrame<'_>);
}

/// A camera backend: validates a configuration, then produces completed
/// frames on its own thread until stopped.
pub trait CaptureSource: Send {
    /// Validate and apply a capture configuration. Fails with
    /// [`CaptureError::Unsupported`] before any resources are committed.
    fn configure(&mut self, config: &CaptureConfig) -> Result<(), CaptureError>;

    /// Begin capture; the sink is invoked once per completed frame from the
    /// driver thread.
    fn start(&mut self, sink: Arc<dyn FrameSink>) -> Result<(), CaptureError>;

    /// Halt capture and join the driver thread. Idempotent; returns once the
    /// subsystem has quiesced and no further completions will be delivered.
    fn stop(&mut self);
}
