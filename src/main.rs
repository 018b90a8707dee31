//! Iris capture-to-bitstream pipeline
//!
//! Pulls frames from the first available camera (or a synthetic pattern
//! source when none is present), encodes I420 streams to H.264 and appends
//! the raw bitstream to `out.h264`.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, warn};

use iris::capture::{CaptureSource, PixelFormat, SyntheticSource, V4l2Source};
use iris::{utils, BitstreamWriter, Config, H264Encoder, StreamEvent, Streamer};

const FRAME_TARGET: u64 = 600;

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("iris=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Iris launching...");

    let mut config = Config::default();

    // Auto-detect a capture device, fall back to the synthetic source
    let source: Box<dyn CaptureSource> = match utils::auto_detect_device() {
        Ok(device) => {
            config.capture.format = device.format;
            config.capture.device = device;
            Box::new(V4l2Source::new())
        }
        Err(e) => {
            warn!("{e}, using synthetic test pattern");
            config.capture.format = PixelFormat::Yuv420;
            Box::new(SyntheticSource::new().with_base_pts(12_346_666))
        }
    };
    iris::CONFIG.store(Arc::new(config.clone()));

    let streamer = Streamer::new(source);
    streamer.open(&config.capture)?;
    streamer.start()?;

    // Colorspace conversion is out of scope; only I420 streams get encoded
    let mut encoder = if config.capture.format == PixelFormat::Yuv420 {
        Some(H264Encoder::open(&config.encoder)?)
    } else {
        warn!(
            "capture format {:?} needs external conversion, capture only",
            config.capture.format
        );
        None
    };
    let mut writer = if encoder.is_some() {
        Some(BitstreamWriter::create("out.h264")?)
    } else {
        None
    };

    let mut frames = 0u64;
    while frames < FRAME_TARGET {
        match streamer.frame(Duration::from_secs(2))? {
            StreamEvent::Frame(frame) => {
                frames += 1;
                if let (Some(encoder), Some(writer)) = (encoder.as_mut(), writer.as_mut()) {
                    let data = frame.data()?;
                    if let Some(packet) =
                        encoder.encode(&data, frame.pts_us(), frame.sequence())?
                    {
                        writer.write_packet(&packet)?;
                    }
                }
                frame.release()?;
            }
            StreamEvent::Timeout => warn!("no frame within timeout"),
            StreamEvent::EndOfStream => break,
        }
    }

    streamer.stop();
    info!(frames, fps = streamer.fps(), "capture finished");
    if let Some(writer) = writer.take() {
        let (bytes, packets, keyframes) = writer.finish()?;
        info!(bytes, packets, keyframes, "wrote out.h264");
    }
    streamer.close();
    Ok(())
}
