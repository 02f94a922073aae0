//! Session orchestration: spawns the capture and writer threads, wires the
//! shared pool/queue/run-flag between them and joins them in order.
//!
//! The capture session may own a thread-bound GPU context, so the source is
//! constructed *inside* the capture thread; a one-shot handshake channel
//! carries the open result (geometry + shared buffer backend) back so the
//! orchestrator can build the writer side.
//!
//! Join order matters: capture exits first (deadline or cleared flag), then
//! the orchestrator clears the flag and the writer drains what is left in
//! the queue before flushing and finalizing.  A writer that fails early
//! clears the flag itself before exiting, so the capture side never waits
//! on slot releases from a consumer that is no longer there.
//!
//! A panic inside either worker means an invariant is already broken (a
//! double release, a corrupted pool); it is logged and the whole process
//! exits rather than leaving the other thread running against shared state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Instant;

use serde::Serialize;

use crate::capture::source::{CaptureSource, CaptureStats, Clock};
use crate::capture::{CaptureBackend, SessionConfig};
use crate::core::buffers::BufferBackend;
use crate::core::handoff::HandoffQueue;
use crate::core::slot_pool::FrameSlotPool;
use crate::core::types::Geometry;
use crate::engine::writer::WriterPipeline;
use crate::error::{CastError, Result};
use crate::io::{PacketSink, Scaler, VideoEncoder};

/// Exit status for a worker-thread fault, after which no cleanup is safe.
const WORKER_FAULT_EXIT: i32 = 70;

#[derive(Clone, Copy, Debug)]
pub struct RecorderConfig {
    pub fps: u32,
    /// Wall-clock run length in microseconds.
    pub duration_us: i64,
    pub pool_slots: usize,
}

/// The writer-side collaborators, built once the target geometry is known.
pub struct WriterParts {
    pub scaler: Box<dyn Scaler>,
    pub encoder: Box<dyn VideoEncoder>,
    pub sink: Box<dyn PacketSink>,
}

/// End-of-session summary, printed as JSON by the CLI.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct SessionReport {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_written: u64,
    pub elapsed_ms: u64,
}

/// Run one capture session to completion.
///
/// `writer_parts` is called on the orchestrator thread once the capture
/// side reports ready, so sink/encoder open errors surface before any
/// frame is grabbed.
pub fn record<B, F>(
    backend: B,
    session: SessionConfig,
    config: RecorderConfig,
    clock: Arc<dyn Clock>,
    writer_parts: F,
) -> Result<SessionReport>
where
    B: CaptureBackend + Send + 'static,
    F: FnOnce(Geometry) -> Result<WriterParts>,
{
    let pool = Arc::new(FrameSlotPool::new(config.pool_slots));
    let queue = Arc::new(HandoffQueue::new());
    let run = Arc::new(AtomicBool::new(true));
    let started = Instant::now();

    let (ready_tx, ready_rx) = mpsc::channel::<Result<(Geometry, Arc<BufferBackend>)>>();

    let capture = {
        let pool = Arc::clone(&pool);
        let queue = Arc::clone(&queue);
        let run = Arc::clone(&run);
        let clock = Arc::clone(&clock);
        let fps = config.fps;
        let duration_us = config.duration_us;
        std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    let strategy = session.strategy;
                    let slices = session.transfer_slices;
                    let mut source = CaptureSource::new(backend, session, fps);
                    let geometry = match source.open() {
                        Ok(g) => g,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return Ok(CaptureStats::default());
                        }
                    };
                    let buffers =
                        Arc::new(BufferBackend::new(strategy, geometry.frame_len(), slices));
                    let _ = ready_tx.send(Ok((geometry, Arc::clone(&buffers))));
                    let stats = source.run(
                        &pool,
                        buffers.as_ref(),
                        &queue,
                        &run,
                        clock.as_ref(),
                        duration_us,
                    );
                    source.close();
                    stats
                }));
                match outcome {
                    Ok(stats) => stats,
                    Err(_) => {
                        tracing::error!("capture thread panicked; aborting process");
                        std::process::exit(WORKER_FAULT_EXIT);
                    }
                }
            })
            .map_err(|e| CastError::Pipeline(format!("spawning capture thread: {e}")))?
    };

    // Wait for the capture side to finish its open sequence.
    let (geometry, buffers) = match ready_rx.recv() {
        Ok(Ok(ready)) => ready,
        Ok(Err(e)) => {
            run.store(false, Ordering::Release);
            let _ = capture.join();
            return Err(e);
        }
        Err(_) => {
            run.store(false, Ordering::Release);
            let _ = capture.join();
            return Err(CastError::ChannelClosed);
        }
    };

    let parts = match writer_parts(geometry) {
        Ok(parts) => parts,
        Err(e) => {
            run.store(false, Ordering::Release);
            let _ = capture.join();
            return Err(e);
        }
    };

    let writer = {
        let pool = Arc::clone(&pool);
        let queue = Arc::clone(&queue);
        let run = Arc::clone(&run);
        let buffers = Arc::clone(&buffers);
        std::thread::Builder::new()
            .name("writer".into())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    let mut pipeline = WriterPipeline::new(parts.scaler, parts.encoder, parts.sink);
                    let result = pipeline.run(&pool, buffers.as_ref(), &queue, &run);
                    if let Err(e) = &result {
                        // The capture side waits on slot releases that will
                        // never come from a dead writer; stop it too.
                        tracing::error!(error = %e, "writer pipeline failed, stopping capture");
                        run.store(false, Ordering::Release);
                    }
                    result
                }));
                match outcome {
                    Ok(written) => written,
                    Err(_) => {
                        tracing::error!("writer thread panicked; aborting process");
                        std::process::exit(WORKER_FAULT_EXIT);
                    }
                }
            })
            .map_err(|e| CastError::Pipeline(format!("spawning writer thread: {e}")))?
    };

    // Capture stops on its own at the deadline; the writer stops once the
    // flag clears and the queue drains.
    let stats = capture
        .join()
        .map_err(|_| CastError::Pipeline("capture thread lost".into()))??;
    run.store(false, Ordering::Release);
    let frames_written = writer
        .join()
        .map_err(|_| CastError::Pipeline("writer thread lost".into()))??;

    let report = SessionReport {
        frames_captured: stats.captured,
        frames_dropped: stats.dropped,
        frames_written,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    tracing::info!(
        captured = report.frames_captured,
        dropped = report.frames_dropped,
        written = report.frames_written,
        elapsed_ms = report.elapsed_ms,
        "session complete"
    );
    Ok(report)
}
