//! Encoder bridge and raw bitstream output

pub mod h264;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use bytes::Bytes;
use thiserror::Error;

pub use h264::H264Encoder;

#[derive(Error, Debug)]
pub enum EncoderError {
    /// Invalid encoder configuration. Fatal at `open`.
    #[error("encoder configuration error: {0}")]
    Config(String),

    /// Malformed submission; reported per call, the stream keeps going.
    #[error("frame rejected: {0}")]
    Frame(String),

    #[error(transparent)]
    Codec(#[from] openh264::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One encoded bitstream unit
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
    /// Copied verbatim from the frame that produced this unit
    pub pts_us: i64,
    /// Decodable without reference to prior units
    pub keyframe: bool,
}

/// Sequential append of encoded payloads to a single output stream.
/// No container, no muxing; the payloads are self-delimiting.
pub struct BitstreamWriter<W: Write> {
    out: W,
    bytes: u64,
    packets: u64,
    keyframes: u64,
}

impl BitstreamWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, EncoderError> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> BitstreamWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            bytes: 0,
            packets: 0,
            keyframes: 0,
        }
    }

    pub fn write_packet(&mut self, packet: &EncodedPacket) -> Result<(), EncoderError> {
        self.out.write_all(&packet.data)?;
        self.bytes += packet.data.len() as u64;
        self.packets += 1;
        if packet.keyframe {
            self.keyframes += 1;
        }
        Ok(())
    }

    /// Flush and return (bytes, packets, keyframes) written.
    pub fn finish(mut self) -> Result<(u64, u64, u64), EncoderError> {
        self.out.flush()?;
        Ok((self.bytes, self.packets, self.keyframes))
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn packets_written(&self) -> u64 {
        self.packets
    }

    pub fn keyframes_written(&self) -> u64 {
        self.keyframes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_appends_payloads_in_order() {
        let mut writer = BitstreamWriter::new(Vec::new());
        writer
            .write_packet(&EncodedPacket {
                data: Bytes::from_static(b"abc"),
                pts_us: 0,
                keyframe: true,
            })
            .unwrap();
        writer
            .write_packet(&EncodedPacket {
                data: Bytes::from_static(b"de"),
                pts_us: 33_000,
                keyframe: false,
            })
            .unwrap();
        assert_eq!(writer.bytes_written(), 5);
        assert_eq!(writer.packets_written(), 2);
        assert_eq!(writer.keyframes_written(), 1);
        let (bytes, packets, keyframes) = writer.finish().unwrap();
        assert_eq!((bytes, packets, keyframes), (5, 2, 1));
    }
}
