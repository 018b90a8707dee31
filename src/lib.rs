pub mod capture;
pub mod encoder;
pub mod pipeline;
pub mod streamer;
pub mod utils;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

use crate::utils::FoundDevice;

pub use crate::capture::{CaptureSource, FrameSink, RawFrame};
pub use crate::encoder::{BitstreamWriter, EncodedPacket, EncoderError, H264Encoder};
pub use crate::pipeline::{BufferError, BufferPool, FrameBuffer, FrameMeta, FrameQueue, PopOutcome};
pub use crate::streamer::{RecordConfig, RecordedFrame, StreamError, StreamEvent, Streamer};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub device: FoundDevice,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    /// Number of in-flight capture buffers; also bounds the frame queue
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u32,
    pub fps: u32,
    /// Keyframe spacing in frames
    pub intra_period: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: FoundDevice::new("/dev/video0".into(), PixelFormat::Bgr24),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Bgr24,
            buffer_count: 4,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            bitrate_bps: 3_000_000,
            fps: 30,
            intra_period: 60,
        }
    }
}
