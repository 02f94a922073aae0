//! Raw-frame output path: no conversion, no compression.
//!
//! Useful without any FFmpeg runtime: frames are written back-to-back as
//! RGBA and can be remuxed afterwards, e.g.
//!
//! ```bash
//! ffmpeg -f rawvideo -pix_fmt rgba -s 1280x720 -r 30 -i capture.raw out.mp4
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::core::types::Rational;
use crate::error::{CastError, Result};
use crate::io::{EncodedPacket, PacketSink, Scaler, VideoEncoder};

/// No-op scaler for sinks that take the capture format as-is.
pub struct PassthroughScaler;

impl Scaler for PassthroughScaler {
    fn convert<'a>(&'a mut self, src: &'a [u8]) -> Result<&'a [u8]> {
        Ok(src)
    }
}

/// "Encoder" that wraps each frame into one packet unmodified.  Every
/// packet is a keyframe; there is no internal buffering to drain.
pub struct RawEncoder {
    time_base: Rational,
}

impl RawEncoder {
    pub fn new(fps: u32) -> Self {
        Self {
            time_base: Rational::per_frame(fps),
        }
    }
}

impl VideoEncoder for RawEncoder {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn submit(&mut self, frame: &[u8], pts: i64) -> Result<Vec<EncodedPacket>> {
        Ok(vec![EncodedPacket {
            data: frame.to_vec(),
            pts,
            dts: pts,
            keyframe: true,
        }])
    }

    fn finish(&mut self) -> Result<Vec<EncodedPacket>> {
        Ok(Vec::new())
    }
}

/// Writes packet payloads back-to-back to a file.
pub struct RawFileSink {
    writer: BufWriter<File>,
    path: PathBuf,
    time_base: Rational,
    bytes_written: u64,
    packets_written: u64,
}

impl RawFileSink {
    pub fn new(path: PathBuf, fps: u32) -> Result<Self> {
        let file = File::create(&path).map_err(|e| {
            CastError::Mux(format!(
                "Failed to create output file {}: {}",
                path.display(),
                e
            ))
        })?;

        tracing::info!(path = %path.display(), "Raw output sink opened");

        Ok(Self {
            writer: BufWriter::with_capacity(4 * 1024 * 1024, file),
            path,
            time_base: Rational::per_frame(fps),
            bytes_written: 0,
            packets_written: 0,
        })
    }
}

impl PacketSink for RawFileSink {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn write_packet(&mut self, packet: &EncodedPacket) -> Result<()> {
        self.writer.write_all(&packet.data).map_err(|e| {
            CastError::Mux(format!("Failed to write to {}: {}", self.path.display(), e))
        })?;

        self.bytes_written += packet.data.len() as u64;
        self.packets_written += 1;

        if self.packets_written % 100 == 0 {
            tracing::debug!(
                packets = self.packets_written,
                bytes_mb = self.bytes_written / (1024 * 1024),
                "Sink progress"
            );
        }

        Ok(())
    }

    fn finalize(&mut self) -> Result<u64> {
        self.writer.flush().map_err(|e| {
            CastError::Mux(format!("Failed to flush {}: {}", self.path.display(), e))
        })?;

        tracing::info!(
            path = %self.path.display(),
            packets = self.packets_written,
            bytes_mb = self.bytes_written / (1024 * 1024),
            "Raw sink flushed"
        );

        Ok(self.packets_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_encoder_is_latency_free() {
        let mut enc = RawEncoder::new(30);
        assert_eq!(enc.time_base(), Rational::new(1, 30));

        let packets = enc.submit(&[1, 2, 3], 7).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pts, 7);
        assert!(packets[0].keyframe);
        assert!(enc.finish().unwrap().is_empty());
    }

    #[test]
    fn raw_sink_concatenates_payloads() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("wincast-raw-sink-{}.bin", std::process::id()));

        let mut sink = RawFileSink::new(path.clone(), 10).unwrap();
        for pts in 0..3 {
            sink.write_packet(&EncodedPacket {
                data: vec![pts as u8; 4],
                pts,
                dts: pts,
                keyframe: true,
            })
            .unwrap();
        }
        assert_eq!(sink.finalize().unwrap(), 3);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, [0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]);
        std::fs::remove_file(&path).ok();
    }
}
