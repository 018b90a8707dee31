//! H.264 encoding bridge over openh264
//!
//! Adapts the engine's call/return convention: one I420 submission in, zero
//! or one packet out, with the submitted timestamp copied onto the packet.
//! The engine runs in camera-real-time mode with no temporal reordering, so
//! submission order equals output order and the timestamp identity holds.

use bytes::Bytes;
use openh264::encoder::{
    BitRate, Encoder, EncoderConfig as H264Config, FrameRate, FrameType, IntraFramePeriod,
    RateControlMode, UsageType,
};
use openh264::formats::YUVSlices;
use openh264::{OpenH264API, Timestamp};
use tracing::{debug, trace};

use super::{EncodedPacket, EncoderError};
use crate::EncoderConfig;

pub struct H264Encoder {
    engine: Encoder,
    width: usize,
    height: usize,
    frame_size: usize,
    submitted: u64,
}

impl H264Encoder {
    /// Open an encoding session. Resolution problems are fatal here, never
    /// per frame.
    pub fn open(config: &EncoderConfig) -> Result<Self, EncoderError> {
        if config.width == 0 || config.height == 0 {
            return Err(EncoderError::Config("resolution must be nonzero".into()));
        }
        if config.width % 2 != 0 || config.height % 2 != 0 {
            return Err(EncoderError::Config(format!(
                "I420 requires even dimensions, got {}x{}",
                config.width, config.height
            )));
        }
        if config.intra_period == 0 {
            return Err(EncoderError::Config("intra period must be nonzero".into()));
        }

        let engine_config = H264Config::new()
            .usage_type(UsageType::CameraVideoRealTime)
            .rate_control_mode(RateControlMode::Bitrate)
            .bitrate(BitRate::from_bps(config.bitrate_bps))
            .max_frame_rate(FrameRate::from_hz(config.fps as f32))
            .intra_frame_period(IntraFramePeriod::from_num_frames(config.intra_period));
        let engine = Encoder::with_api_config(OpenH264API::from_source(), engine_config)?;

        let width = config.width as usize;
        let height = config.height as usize;
        debug!(
            width,
            height,
            bitrate = config.bitrate_bps,
            intra = config.intra_period,
            "encoder opened"
        );
        Ok(Self {
            engine,
            width,
            height,
            frame_size: width * height * 3 / 2,
            submitted: 0,
        })
    }

    /// Submit one I420 frame. `Ok(None)` means the engine produced no output
    /// for this submission; a later one may carry it. The returned packet's
    /// timestamp always equals `pts_us`.
    pub fn encode(
        &mut self,
        i420: &[u8],
        pts_us: i64,
        field: u64,
    ) -> Result<Option<EncodedPacket>, EncoderError> {
        if i420.len() != self.frame_size {
            return Err(EncoderError::Frame(format!(
                "expected {} bytes of I420 for {}x{}, got {}",
                self.frame_size,
                self.width,
                self.height,
                i420.len()
            )));
        }

        let luma_size = self.width * self.height;
        let chroma_size = luma_size / 4;
        let (y, chroma) = i420.split_at(luma_size);
        let (u, v) = chroma.split_at(chroma_size);
        let slices = YUVSlices::new(
            (y, u, v),
            (self.width, self.height),
            (self.width, self.width / 2, self.width / 2),
        );

        let timestamp = Timestamp::from_millis(pts_us.max(0) as u64 / 1_000);
        let bitstream = self.engine.encode_at(&slices, timestamp)?;
        self.submitted += 1;
        trace!(pts_us, field, "frame submitted");

        let frame_type = bitstream.frame_type();
        if matches!(frame_type, FrameType::Skip | FrameType::Invalid) {
            return Ok(None);
        }
        let data = Bytes::from(bitstream.to_vec());
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(EncodedPacket {
            data,
            pts_us,
            keyframe: matches!(frame_type, FrameType::IDR | FrameType::I),
        }))
    }

    /// Frames submitted so far
    pub fn submitted(&self) -> u64 {
        self.submitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::test_pattern;
    use crate::capture::PixelFormat;

    #[test]
    fn open_rejects_bad_resolutions() {
        let odd = EncoderConfig {
            width: 641,
            ..EncoderConfig::default()
        };
        assert!(matches!(
            H264Encoder::open(&odd),
            Err(EncoderError::Config(_))
        ));
        let zero = EncoderConfig {
            height: 0,
            ..EncoderConfig::default()
        };
        assert!(matches!(
            H264Encoder::open(&zero),
            Err(EncoderError::Config(_))
        ));
    }

    #[test]
    fn wrong_sized_submission_is_a_per_call_error() {
        let mut encoder = H264Encoder::open(&EncoderConfig::default()).unwrap();
        assert!(matches!(
            encoder.encode(&[0u8; 16], 0, 0),
            Err(EncoderError::Frame(_))
        ));
        // the session survives and still encodes
        let frame = test_pattern(640, 480, PixelFormat::Yuv420);
        let packet = encoder.encode(&frame, 0, 0).unwrap();
        assert!(packet.is_some());
    }

    #[test]
    fn first_packet_is_a_keyframe_with_the_submitted_pts() {
        let mut encoder = H264Encoder::open(&EncoderConfig::default()).unwrap();
        let frame = test_pattern(640, 480, PixelFormat::Yuv420);
        let packet = encoder.encode(&frame, 12_346_666, 567).unwrap().unwrap();
        assert!(packet.keyframe);
        assert!(!packet.data.is_empty());
        assert_eq!(packet.pts_us, 12_346_666);
    }
}
