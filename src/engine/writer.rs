//! The consumer side: pops captured units, converts, encodes, rescales
//! timestamps and writes packets, releasing every consumed slot back to
//! its backend whether or not the encoder produced output that round.
//!
//! Shutdown is noticed on a pop timeout: the loop runs until the stop flag
//! clears AND the queue is drained, then flushes the encoder and finalizes
//! the sink.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::buffers::FrameBuffers;
use crate::core::handoff::{HandoffQueue, POP_TIMEOUT};
use crate::core::slot_pool::FrameSlotPool;
use crate::core::types::{rescale, CapturedUnit};
use crate::error::{CastError, Result};
use crate::io::{EncodedPacket, PacketSink, Scaler, VideoEncoder};

pub struct WriterPipeline {
    scaler: Box<dyn Scaler>,
    encoder: Box<dyn VideoEncoder>,
    sink: Box<dyn PacketSink>,
    /// Strictly increasing presentation index, in encoder time-base ticks.
    frames_in: i64,
    frames_written: u64,
}

impl WriterPipeline {
    pub fn new(
        scaler: Box<dyn Scaler>,
        encoder: Box<dyn VideoEncoder>,
        sink: Box<dyn PacketSink>,
    ) -> Self {
        Self {
            scaler,
            encoder,
            sink,
            frames_in: 0,
            frames_written: 0,
        }
    }

    /// Consume until the run flag clears and the queue is empty, then flush
    /// the encoder and finalize the sink.  Returns frames written.
    pub fn run(
        &mut self,
        pool: &FrameSlotPool,
        buffers: &dyn FrameBuffers,
        queue: &HandoffQueue<CapturedUnit>,
        run: &AtomicBool,
    ) -> Result<u64> {
        loop {
            match queue.pop(POP_TIMEOUT) {
                Some(unit) => self.process_unit(pool, buffers, unit)?,
                None => {
                    // Timed out empty: the producer pushes nothing after
                    // the flag clears, so empty + cleared means done.
                    if !run.load(Ordering::Acquire) && queue.is_empty() {
                        break;
                    }
                }
            }
        }

        let tail = self.encoder.finish()?;
        self.write_packets(tail)?;
        let sink_total = self.sink.finalize()?;
        tracing::info!(
            frames_in = self.frames_in,
            frames_written = self.frames_written,
            sink_packets = sink_total,
            "writer pipeline finished"
        );
        Ok(self.frames_written)
    }

    /// Encode one unit.  The slot and its buffer are returned to their
    /// pools unconditionally, even when the encoder held the frame back or
    /// the unit failed.
    fn process_unit(
        &mut self,
        pool: &FrameSlotPool,
        buffers: &dyn FrameBuffers,
        mut unit: CapturedUnit,
    ) -> Result<()> {
        let payload = pool.take(&mut unit.claim);
        let result = match &payload {
            Some(buf) => self.encode_frame(buf.as_slice()),
            None => Err(CastError::InvariantViolation(format!(
                "unit {} arrived without a payload",
                unit.seq
            ))),
        };
        if let Some(buf) = payload {
            buffers.release(buf.into_token());
        }
        pool.release(unit.claim);
        result
    }

    fn encode_frame(&mut self, rgba: &[u8]) -> Result<()> {
        let converted = self.scaler.convert(rgba)?;
        let pts = self.frames_in;
        let packets = self.encoder.submit(converted, pts)?;
        self.frames_in += 1;
        self.write_packets(packets)
    }

    /// Rescale from the encoder's time base to the sink's and write.
    fn write_packets(&mut self, packets: Vec<EncodedPacket>) -> Result<()> {
        let enc_tb = self.encoder.time_base();
        let sink_tb = self.sink.time_base();
        for mut packet in packets {
            packet.pts = rescale(packet.pts, enc_tb, sink_tb);
            packet.dts = rescale(packet.dts, enc_tb, sink_tb);
            self.sink.write_packet(&packet)?;
            self.frames_written += 1;
        }
        Ok(())
    }
}
