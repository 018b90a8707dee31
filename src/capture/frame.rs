use serde::{Deserialize, Serialize};

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Bgr24,
    Yuv420,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes needed for one frame of `width` x `height` in this format.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let area = (width * height) as usize;
        match self {
            PixelFormat::Bgr24 => area * 3,
            PixelFormat::Yuv420 => area * 3 / 2,
            PixelFormat::Yuyv4 => area * 2,
            // MJPEG is variable-length; reserve for the worst case we accept
            PixelFormat::Mjpeg => area * 2,
        }
    }
}

/// A completed capture delivered by the subsystem's driver thread.
///
/// The memory region is only valid for the duration of the completion
/// callback; the sink copies it into pool-owned storage before returning.
#[derive(Debug)]
pub struct RawFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    /// Capture timestamp in microseconds, subsystem epoch
    pub pts_us: i64,
    /// Driver sequence counter
    pub sequence: u64,
}

/// A capture mode the sensor pipeline supports
#[derive(Debug, Clone, Copy)]
pub struct CaptureMode {
    pub width: u32,
    pub height: u32,
    pub min_fps: u32,
    pub max_fps: u32,
}

/// Sensor modes we accept at `open()` time.
pub fn supported_modes() -> &'static [CaptureMode] {
    static MODES: [CaptureMode; 3] = [
        CaptureMode { width: 320, height: 240, min_fps: 4, max_fps: 90 },
        CaptureMode { width: 640, height: 480, min_fps: 4, max_fps: 90 },
        CaptureMode { width: 1280, height: 960, min_fps: 4, max_fps: 90 },
    ];
    &MODES
}

/// Look up the mode matching a requested resolution.
pub fn find_mode(width: u32, height: u32) -> Option<&'static CaptureMode> {
    supported_modes()
        .iter()
        .find(|m| m.width == width && m.height == height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::Bgr24.frame_size(640, 480), 640 * 480 * 3);
        assert_eq!(PixelFormat::Yuv420.frame_size(640, 480), 640 * 480 * 3 / 2);
    }

    #[test]
    fn mode_lookup() {
        assert!(find_mode(640, 480).is_some());
        assert!(find_mode(641, 480).is_none());
        let m = find_mode(1280, 960).unwrap();
        assert!(m.min_fps <= 30 && 30 <= m.max_fps);
    }
}
