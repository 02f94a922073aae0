//! Output side of the pipeline: scaler, encoder and packet sink contracts,
//! plus the concrete implementations.
//!
//! - [`raw`] — passthrough scaler and raw-frame file sink, always available.
//! - [`ffmpeg`] — swscale conversion, MPEG-4 encoding and container muxing
//!   behind the `ffmpeg-runtime` feature (a stub that fails at open is
//!   compiled otherwise).
//!
//! Timestamps: encoders emit packets in their own time base; the writer
//! rescales to the sink's time base before `write_packet`.

pub mod raw;

#[cfg(feature = "ffmpeg-runtime")]
pub mod ffmpeg;
#[cfg(not(feature = "ffmpeg-runtime"))]
#[path = "ffmpeg_stub.rs"]
pub mod ffmpeg;

use crate::core::types::Rational;
use crate::error::Result;

/// One encoded packet, ready for the sink.
#[derive(Clone, Debug)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    /// Presentation timestamp in the producing encoder's time base.
    pub pts: i64,
    pub dts: i64,
    pub keyframe: bool,
}

/// Pixel-format/resolution converter, configured once per session.
pub trait Scaler: Send {
    /// Convert one source frame; the returned slice is valid until the next
    /// call.
    fn convert<'a>(&'a mut self, src: &'a [u8]) -> Result<&'a [u8]>;
}

/// Video encoder contract.
///
/// An encoder may buffer internally and emit with lag: `submit` returning
/// no packets is a normal steady-state condition, not an error.  `finish`
/// signals end-of-stream and drains whatever is still buffered.
pub trait VideoEncoder: Send {
    /// Time base of emitted packet timestamps.
    fn time_base(&self) -> Rational;

    /// Submit one frame (`pts` in `time_base` ticks); returns zero or more
    /// packets that became ready.
    fn submit(&mut self, frame: &[u8], pts: i64) -> Result<Vec<EncodedPacket>>;

    /// Flush: no more frames will arrive; drain all buffered packets.
    fn finish(&mut self) -> Result<Vec<EncodedPacket>>;
}

/// Packet destination (raw file or media container).
pub trait PacketSink: Send {
    /// Time base packets must carry when handed to `write_packet`.
    fn time_base(&self) -> Rational;

    fn write_packet(&mut self, packet: &EncodedPacket) -> Result<()>;

    /// Finalize the output (trailer, flush) and report packets written.
    fn finalize(&mut self) -> Result<u64>;
}
