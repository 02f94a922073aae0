//! The paced capture producer.
//!
//! `CaptureSource` walks the `Closed → Opening → Ready → Capturing → Closed`
//! lifecycle.  Open acquires the backend session and sizes the buffer pool
//! from the target geometry; the capture loop then ticks at a fixed cadence,
//! parking each grabbed frame in a pool slot and pushing a timestamped unit
//! onto the handoff queue.
//!
//! Pacing never captures early: each tick advances the anchor by exactly one
//! frame duration and waits for the wall clock to reach it, so frame spacing
//! stays constant even when the capture work itself is fast.  Backpressure
//! (no free buffer slice) drops the tick's frame with a rate-limited warning
//! instead of stalling the cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::capture::{CaptureBackend, CaptureSession, CaptureState, SessionConfig};
use crate::core::buffers::FrameBuffers;
use crate::core::handoff::HandoffQueue;
use crate::core::slot_pool::FrameSlotPool;
use crate::core::types::{CapturedUnit, Geometry};
use crate::error::{CastError, Result};

/// Time source for the pacing loop.  Production uses [`SystemClock`]; tests
/// substitute a simulated clock to make the cadence deterministic.
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary fixed epoch.
    fn now_us(&self) -> i64;
    /// Cooperatively wait until `now_us() >= deadline_us`.
    fn sleep_until(&self, deadline_us: i64);
}

/// Monotonic wall clock.  Sleeps coarsely, then yields away the last
/// millisecond so ticks land on the anchor rather than after it.
pub struct SystemClock {
    epoch: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    fn sleep_until(&self, deadline_us: i64) {
        loop {
            let now = self.now_us();
            if now >= deadline_us {
                return;
            }
            let remaining = (deadline_us - now) as u64;
            if remaining > 2_000 {
                std::thread::sleep(Duration::from_micros(remaining - 1_000));
            } else {
                std::thread::yield_now();
            }
        }
    }
}

/// Counters reported when the capture loop exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Units successfully handed to the consumer.
    pub captured: u64,
    /// Ticks skipped because no buffer slice was free.
    pub dropped: u64,
}

/// Minimum spacing between "consumer too slow" warnings.
const DROP_WARN_INTERVAL_US: i64 = 1_000_000;

/// The capture-side state machine and producer loop.
pub struct CaptureSource<B: CaptureBackend> {
    backend: B,
    config: SessionConfig,
    fps: u32,
    state: CaptureState,
    session: Option<B::Session>,
}

impl<B: CaptureBackend> CaptureSource<B> {
    pub fn new(backend: B, config: SessionConfig, fps: u32) -> Self {
        assert!(fps >= 1, "capture rate must be at least 1 fps");
        Self {
            backend,
            config,
            fps,
            state: CaptureState::Closed,
            session: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Acquire the capture session.
    ///
    /// On success the source is `Ready` and the returned geometry sizes the
    /// buffer backend.  On any failure the backend has already torn down
    /// its partial resource chain and the source is back in `Closed`.
    pub fn open(&mut self) -> Result<Geometry> {
        if self.state != CaptureState::Closed {
            return Err(CastError::Pipeline(format!(
                "open from state {:?}",
                self.state
            )));
        }
        self.state = CaptureState::Opening;
        tracing::info!(
            target = %self.config.target.pattern,
            strategy = ?self.config.strategy,
            "opening capture source"
        );
        let session = match self.backend.open(&self.config) {
            Ok(s) => s,
            Err(e) => {
                self.state = CaptureState::Closed;
                return Err(e);
            }
        };
        let geometry = session.geometry();
        self.session = Some(session);
        self.state = CaptureState::Ready;
        tracing::info!(
            width = geometry.width,
            height = geometry.height,
            depth = geometry.depth,
            "capture source ready"
        );
        Ok(geometry)
    }

    /// Run the paced capture loop until the run flag clears or the next
    /// anchor would pass `duration_us`.
    ///
    /// Each tick: advance the anchor by one frame duration, wait for it,
    /// claim a slot (yield-retry until the consumer releases one, bounded by
    /// the run flag and the deadline), obtain a buffer (skip the tick and
    /// warn when the slice
    /// pool is exhausted), grab the pixels, stamp with the anchor time and
    /// push.  The run flag is observed only between ticks, so a tick always
    /// completes or skips atomically.
    pub fn run(
        &mut self,
        pool: &FrameSlotPool,
        buffers: &dyn FrameBuffers,
        queue: &HandoffQueue<CapturedUnit>,
        run: &AtomicBool,
        clock: &dyn Clock,
        duration_us: i64,
    ) -> Result<CaptureStats> {
        if self.state != CaptureState::Ready {
            return Err(CastError::Pipeline(format!(
                "capture run from state {:?}",
                self.state
            )));
        }
        self.state = CaptureState::Capturing;

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CastError::InvariantViolation("ready source without session".into()))?;

        let frame_len = session.geometry().frame_len();
        let frame_dur = 1_000_000 / self.fps as i64;
        let start = clock.now_us();
        let deadline = start + duration_us;
        let mut anchor = start;
        let mut stats = CaptureStats::default();
        let mut seq: u64 = 0;
        let mut last_drop_warn = i64::MIN;

        'ticks: loop {
            anchor += frame_dur;
            if !run.load(Ordering::Acquire) || anchor > deadline {
                break;
            }
            clock.sleep_until(anchor);
            seq += 1;

            // First-fit slot claim; the pool promises no fairness, so retry
            // cooperatively until the consumer frees one.  A dead consumer
            // never frees a slot, so the retry also gives up once the run
            // flag clears or the wall clock passes the session deadline.
            let mut claim = loop {
                match pool.acquire() {
                    Some(c) => break c,
                    None => {
                        if !run.load(Ordering::Acquire) || clock.now_us() > deadline {
                            break 'ticks;
                        }
                        std::thread::yield_now();
                    }
                }
            };

            match buffers.acquire_frame(frame_len, session)? {
                Some(buf) => {
                    pool.store(&mut claim, buf);
                    queue.push(CapturedUnit {
                        claim,
                        pts_us: anchor,
                        duration_us: frame_dur,
                        seq,
                    });
                    stats.captured += 1;
                }
                None => {
                    pool.release(claim);
                    stats.dropped += 1;
                    if anchor.saturating_sub(last_drop_warn) >= DROP_WARN_INTERVAL_US {
                        last_drop_warn = anchor;
                        tracing::warn!(
                            seq,
                            dropped = stats.dropped,
                            "consumer too slow, dropping frame"
                        );
                    }
                }
            }
        }

        self.state = CaptureState::Ready;
        tracing::info!(
            captured = stats.captured,
            dropped = stats.dropped,
            "capture loop finished"
        );
        Ok(stats)
    }

    /// Tear the session down.  Idempotent, callable from any state.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.state = CaptureState::Closed;
    }
}

impl<B: CaptureBackend> Drop for CaptureSource<B> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TargetSelector;
    use crate::core::buffers::{BufferBackend, BufferStrategy, GpuTransfer};
    use std::sync::Mutex;

    /// Simulated clock: `sleep_until` jumps straight to the deadline, which
    /// models instantaneous capture work.
    struct MockClock {
        now: Mutex<i64>,
    }

    impl MockClock {
        fn new() -> Self {
            Self { now: Mutex::new(0) }
        }
    }

    impl Clock for MockClock {
        fn now_us(&self) -> i64 {
            *self.now.lock().unwrap()
        }

        fn sleep_until(&self, deadline_us: i64) {
            let mut now = self.now.lock().unwrap();
            if *now < deadline_us {
                *now = deadline_us;
            }
        }
    }

    struct FakeSession {
        closed: u32,
    }

    impl CaptureSession for FakeSession {
        fn geometry(&self) -> Geometry {
            Geometry::new(4, 2, 24)
        }

        fn grab_into(&mut self, dst: &mut [u8]) -> Result<()> {
            dst.fill(0x42);
            Ok(())
        }

        fn transfer(&mut self) -> Option<&mut dyn GpuTransfer> {
            None
        }

        fn close(&mut self) {
            self.closed += 1;
        }
    }

    struct FakeBackend {
        fail_open: bool,
    }

    impl CaptureBackend for FakeBackend {
        type Session = FakeSession;

        fn open(&mut self, _config: &SessionConfig) -> Result<FakeSession> {
            if self.fail_open {
                Err(CastError::TargetNotFound("nope".into()))
            } else {
                Ok(FakeSession { closed: 0 })
            }
        }
    }

    fn config(strategy: BufferStrategy, slices: usize) -> SessionConfig {
        SessionConfig {
            target: TargetSelector::new("test"),
            strategy,
            transfer_slices: slices,
        }
    }

    #[test]
    fn open_failure_returns_to_closed() {
        let mut src = CaptureSource::new(
            FakeBackend { fail_open: true },
            config(BufferStrategy::Heap, 0),
            10,
        );
        assert!(matches!(src.open(), Err(CastError::TargetNotFound(_))));
        assert_eq!(src.state(), CaptureState::Closed);
    }

    #[test]
    fn close_is_idempotent_from_any_state() {
        let mut src = CaptureSource::new(
            FakeBackend { fail_open: false },
            config(BufferStrategy::Heap, 0),
            10,
        );
        // Closed → close is a no-op.
        src.close();
        assert_eq!(src.state(), CaptureState::Closed);

        src.open().unwrap();
        src.close();
        src.close();
        assert_eq!(src.state(), CaptureState::Closed);
    }

    #[test]
    fn ten_fps_for_one_second_yields_exactly_ten_units() {
        let mut src = CaptureSource::new(
            FakeBackend { fail_open: false },
            config(BufferStrategy::Heap, 0),
            10,
        );
        let geometry = src.open().unwrap();
        let buffers = BufferBackend::new(BufferStrategy::Heap, geometry.frame_len(), 0);

        let pool = FrameSlotPool::new(16);
        let queue = HandoffQueue::new();
        let run = AtomicBool::new(true);
        let clock = MockClock::new();

        let stats = src
            .run(&pool, &buffers, &queue, &run, &clock, 1_000_000)
            .unwrap();
        assert_eq!(stats, CaptureStats { captured: 10, dropped: 0 });

        // Timestamps are monotonically increasing, spaced exactly 100ms.
        let mut prev = 0;
        for i in 1..=10u64 {
            let mut unit = queue.pop(Duration::from_millis(1)).expect("unit");
            assert_eq!(unit.seq, i);
            assert_eq!(unit.pts_us - prev, 100_000);
            assert_eq!(unit.duration_us, 100_000);
            prev = unit.pts_us;
            assert!(pool.payload(&unit.claim).is_some());
            pool.take(&mut unit.claim);
            pool.release(unit.claim);
        }
        assert!(queue.is_empty());
        src.close();
    }

    #[test]
    fn slab_exhaustion_drops_ticks_without_blocking() {
        let mut src = CaptureSource::new(
            FakeBackend { fail_open: false },
            config(BufferStrategy::Slab, 2),
            10,
        );
        let geometry = src.open().unwrap();
        let buffers = BufferBackend::new(BufferStrategy::Slab, geometry.frame_len(), 2);

        let pool = FrameSlotPool::new(16);
        let queue = HandoffQueue::new();
        let run = AtomicBool::new(true);
        let clock = MockClock::new();

        // Nobody consumes: only the 2 slab slices' worth of ticks can land.
        let stats = src
            .run(&pool, &buffers, &queue, &run, &clock, 500_000)
            .unwrap();
        assert_eq!(stats.captured, 2);
        assert_eq!(stats.dropped, 3);
        assert_eq!(queue.len(), 2);
        src.close();
    }

    /// Clock that also creeps forward on every query, so retry loops observe
    /// wall time passing while they spin.
    struct TickingClock {
        now: Mutex<i64>,
        step: i64,
    }

    impl Clock for TickingClock {
        fn now_us(&self) -> i64 {
            let mut now = self.now.lock().unwrap();
            *now += self.step;
            *now
        }

        fn sleep_until(&self, deadline_us: i64) {
            let mut now = self.now.lock().unwrap();
            if *now < deadline_us {
                *now = deadline_us;
            }
        }
    }

    #[test]
    fn full_pool_with_no_consumer_stops_at_the_deadline() {
        let mut src = CaptureSource::new(
            FakeBackend { fail_open: false },
            config(BufferStrategy::Heap, 0),
            10,
        );
        let geometry = src.open().unwrap();
        let buffers = BufferBackend::new(BufferStrategy::Heap, geometry.frame_len(), 0);

        // One slot and nobody releasing it: the second tick's slot retry
        // must give up at the session deadline instead of spinning forever.
        let pool = FrameSlotPool::new(1);
        let queue = HandoffQueue::new();
        let run = AtomicBool::new(true);
        let clock = TickingClock {
            now: Mutex::new(0),
            step: 10_000,
        };

        let stats = src
            .run(&pool, &buffers, &queue, &run, &clock, 500_000)
            .unwrap();
        assert_eq!(stats, CaptureStats { captured: 1, dropped: 0 });
        assert_eq!(queue.len(), 1);
        src.close();
    }

    #[test]
    fn cleared_run_flag_stops_between_ticks() {
        let mut src = CaptureSource::new(
            FakeBackend { fail_open: false },
            config(BufferStrategy::Heap, 0),
            10,
        );
        let geometry = src.open().unwrap();
        let buffers = BufferBackend::new(BufferStrategy::Heap, geometry.frame_len(), 0);

        let pool = FrameSlotPool::new(16);
        let queue = HandoffQueue::new();
        let run = AtomicBool::new(false);
        let clock = MockClock::new();

        let stats = src
            .run(&pool, &buffers, &queue, &run, &clock, 1_000_000)
            .unwrap();
        assert_eq!(stats, CaptureStats::default());
        assert!(queue.is_empty());
    }
}
