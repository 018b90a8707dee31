//! V4L2 capture backend with memory-mapped buffers
//!
//! The device is validated at configure time; `start` hands a driver thread
//! ownership of the stream, and every dequeued buffer is delivered to the
//! completion sink with the driver-reported timestamp and sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{PixelFormat, RawFrame};
use super::{CaptureError, CaptureSource, FrameSink};
use crate::CaptureConfig;

pub struct V4l2Source {
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl V4l2Source {
    pub fn new() -> Self {
        Self {
            config: CaptureConfig::default(),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn fourcc(format: PixelFormat) -> FourCC {
        match format {
            PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
            PixelFormat::Yuv420 => FourCC::new(b"YU12"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        }
    }

    fn apply_format(device: &Device, config: &CaptureConfig) -> Result<(), CaptureError> {
        let mut fmt = device
            .format()
            .map_err(|e| CaptureError::Device(e.to_string()))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = Self::fourcc(config.format);
        let actual = device
            .set_format(&fmt)
            .map_err(|e| CaptureError::Device(e.to_string()))?;
        if actual.width != config.width
            || actual.height != config.height
            || actual.fourcc != fmt.fourcc
        {
            return Err(CaptureError::Unsupported(format!(
                "device negotiated {}x{} {} instead of {}x{} {}",
                actual.width, actual.height, actual.fourcc, config.width, config.height, fmt.fourcc
            )));
        }
        Ok(())
    }
}

impl Default for V4l2Source {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for V4l2Source {
    fn configure(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        info!("configuring V4L2 capture: {:?}", config.device);
        let device = Device::with_path(&config.device.path)
            .map_err(|e| CaptureError::Device(e.to_string()))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::Device(e.to_string()))?;
        info!("device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Unsupported(
                "device does not support video capture".into(),
            ));
        }

        Self::apply_format(&device, config)?;
        self.config = config.clone();
        Ok(())
    }

    fn start(&mut self, sink: Arc<dyn FrameSink>) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);

        let bytes_per_pixel = match config.format {
            PixelFormat::Bgr24 => 3,
            PixelFormat::Yuyv4 => 2,
            PixelFormat::Yuv420 => 1,
            PixelFormat::Mjpeg => 0,
        };

        let worker = std::thread::Builder::new()
            .name("iris-v4l2".into())
            .spawn(move || {
                let device = match Device::with_path(&config.device.path) {
                    Ok(device) => device,
                    Err(e) => {
                        error!("failed to reopen capture device: {e}");
                        return;
                    }
                };
                if let Err(e) = Self::apply_format(&device, &config) {
                    error!("failed to apply capture format: {e}");
                    return;
                }
                let mut stream =
                    match MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
                    {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!("failed to map capture buffers: {e}");
                            return;
                        }
                    };
                info!(
                    buffers = config.buffer_count,
                    "capture stream started"
                );

                while running.load(Ordering::Acquire) {
                    match stream.next() {
                        Ok((buf, meta)) => {
                            let pts_us = meta.timestamp.sec as i64 * 1_000_000
                                + meta.timestamp.usec as i64;
                            sink.frame_complete(RawFrame {
                                data: buf,
                                width: config.width,
                                height: config.height,
                                stride: config.width * bytes_per_pixel,
                                format: config.format,
                                pts_us,
                                sequence: meta.sequence as u64,
                            });
                        }
                        Err(e) => {
                            warn!("capture dequeue failed: {e}");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| CaptureError::Resource(e.to_string()))?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.stop();
    }
}
