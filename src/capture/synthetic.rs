//! Deterministic test-pattern capture source
//!
//! Stands in for the camera stack in tests and on machines without a video
//! device: a driver thread produces banded test frames at the configured
//! rate with evenly spaced timestamps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use super::frame::{PixelFormat, RawFrame};
use super::{CaptureError, CaptureSource, FrameSink};
use crate::CaptureConfig;

const BAND_VALUES: [u8; 4] = [90, 200, 175, 0];

pub struct SyntheticSource {
    config: CaptureConfig,
    base_pts_us: i64,
    frame_limit: Option<u64>,
    paced: bool,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            config: CaptureConfig::default(),
            base_pts_us: 0,
            frame_limit: None,
            paced: true,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Subsystem timestamp of the first frame (microseconds)
    pub fn with_base_pts(mut self, pts_us: i64) -> Self {
        self.base_pts_us = pts_us;
        self
    }

    /// Produce at most `limit` frames, then go quiet
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Produce frames as fast as the sink accepts them
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for SyntheticSource {
    fn configure(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        match config.format {
            PixelFormat::Bgr24 | PixelFormat::Yuv420 => {}
            other => {
                return Err(CaptureError::Unsupported(format!(
                    "synthetic source cannot generate {other:?}"
                )))
            }
        }
        self.config = config.clone();
        Ok(())
    }

    fn start(&mut self, sink: Arc<dyn FrameSink>) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let config = self.config.clone();
        let base_pts_us = self.base_pts_us;
        let frame_limit = self.frame_limit;
        let paced = self.paced;
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);

        let worker = std::thread::Builder::new()
            .name("iris-synth".into())
            .spawn(move || {
                let frame_time_us = 1_000_000 / i64::from(config.fps.max(1));
                let data = test_pattern(config.width, config.height, config.format);
                let stride = config.width
                    * match config.format {
                        PixelFormat::Bgr24 => 3,
                        _ => 1,
                    };
                let mut sequence = 0u64;
                info!(fps = config.fps, "synthetic capture running");
                while running.load(Ordering::Acquire) {
                    if frame_limit.is_some_and(|limit| sequence >= limit) {
                        break;
                    }
                    sink.frame_complete(RawFrame {
                        data: &data,
                        width: config.width,
                        height: config.height,
                        stride,
                        format: config.format,
                        pts_us: base_pts_us + sequence as i64 * frame_time_us,
                        sequence,
                    });
                    sequence += 1;
                    if paced {
                        std::thread::sleep(Duration::from_micros(frame_time_us as u64));
                    }
                }
                debug!(frames = sequence, "synthetic capture finished");
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

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Banded test frame: half-width luma bands swapped at mid-height, quarter
/// bands below. I420 frames get neutral chroma.
pub fn test_pattern(width: u32, height: u32, format: PixelFormat) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut luma = Vec::with_capacity(w * h);
    for row in 0..h {
        let swap = row >= h / 2;
        for col in 0..w {
            let mut band = (col * 4 / w) % 4;
            if swap {
                band = (band + 2) % 4;
            }
            luma.push(BAND_VALUES[band]);
        }
    }
    match format {
        PixelFormat::Yuv420 => {
            let mut frame = luma;
            frame.resize(w * h * 3 / 2, 128);
            frame
        }
        _ => luma.iter().flat_map(|&y| [y, y, y]).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_sizes_match_format() {
        assert_eq!(
            test_pattern(640, 480, PixelFormat::Yuv420).len(),
            640 * 480 * 3 / 2
        );
        assert_eq!(
            test_pattern(640, 480, PixelFormat::Bgr24).len(),
            640 * 480 * 3
        );
    }

    #[test]
    fn rejects_formats_it_cannot_generate() {
        let mut source = SyntheticSource::new();
        let config = CaptureConfig {
            format: PixelFormat::Mjpeg,
            ..CaptureConfig::default()
        };
        assert!(matches!(
            source.configure(&config),
            Err(CaptureError::Unsupported(_))
        ));
    }
}
