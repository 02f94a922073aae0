//! End-to-end pipeline scenarios over a simulated clock and a fake capture
//! backend: full-session cadence, encoder lag draining, and backpressure
//! drops.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use wincast::capture::source::{CaptureSource, Clock};
use wincast::capture::{CaptureBackend, CaptureSession, SessionConfig, TargetSelector};
use wincast::core::buffers::{BufferBackend, BufferStrategy, FrameBuffers, GpuTransfer, PixelBuffer, ReleaseToken};
use wincast::core::handoff::HandoffQueue;
use wincast::core::slot_pool::FrameSlotPool;
use wincast::core::types::{CapturedUnit, Geometry, Rational};
use wincast::engine::{record, RecorderConfig, WriterParts, WriterPipeline};
use wincast::error::{CastError, Result};
use wincast::io::raw::{PassthroughScaler, RawEncoder};
use wincast::io::{EncodedPacket, PacketSink, Scaler, VideoEncoder};

// ─── Fakes ──────────────────────────────────────────────────────────────────

/// Simulated clock: sleeping jumps straight to the deadline, which models
/// instantaneous capture work.
struct SimClock {
    now: Mutex<i64>,
}

impl SimClock {
    fn new() -> Self {
        Self { now: Mutex::new(0) }
    }
}

impl Clock for SimClock {
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

/// Fake session: each grab fills the frame with a running counter so the
/// sink can verify delivery order.
struct FakeSession {
    grabs: u8,
}

impl CaptureSession for FakeSession {
    fn geometry(&self) -> Geometry {
        Geometry::new(4, 2, 24)
    }

    fn grab_into(&mut self, dst: &mut [u8]) -> Result<()> {
        self.grabs += 1;
        dst.fill(self.grabs);
        Ok(())
    }

    fn transfer(&mut self) -> Option<&mut dyn GpuTransfer> {
        None
    }

    fn close(&mut self) {}
}

struct FakeBackend {
    fail_open: bool,
}

impl CaptureBackend for FakeBackend {
    type Session = FakeSession;

    fn open(&mut self, _config: &SessionConfig) -> Result<FakeSession> {
        if self.fail_open {
            Err(CastError::TargetNotFound("no such window".into()))
        } else {
            Ok(FakeSession { grabs: 0 })
        }
    }
}

/// Sink recording every packet it is handed.
#[derive(Clone)]
struct CollectingSink {
    time_base: Rational,
    written: Arc<Mutex<Vec<EncodedPacket>>>,
}

impl PacketSink for CollectingSink {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn write_packet(&mut self, packet: &EncodedPacket) -> Result<()> {
        self.written.lock().unwrap().push(packet.clone());
        Ok(())
    }

    fn finalize(&mut self) -> Result<u64> {
        Ok(self.written.lock().unwrap().len() as u64)
    }
}

/// Encoder that holds `lag` frames before emitting; `finish` drains the
/// rest.
struct BufferingEncoder {
    lag: usize,
    held: VecDeque<EncodedPacket>,
    time_base: Rational,
}

impl BufferingEncoder {
    fn new(lag: usize, fps: u32) -> Self {
        Self {
            lag,
            held: VecDeque::new(),
            time_base: Rational::per_frame(fps),
        }
    }
}

impl VideoEncoder for BufferingEncoder {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn submit(&mut self, frame: &[u8], pts: i64) -> Result<Vec<EncodedPacket>> {
        self.held.push_back(EncodedPacket {
            data: frame.to_vec(),
            pts,
            dts: pts,
            keyframe: pts == 0,
        });
        if self.held.len() > self.lag {
            Ok(vec![self.held.pop_front().unwrap()])
        } else {
            Ok(Vec::new())
        }
    }

    fn finish(&mut self) -> Result<Vec<EncodedPacket>> {
        Ok(self.held.drain(..).collect())
    }
}

/// Sink whose first write fails, as a full disk would.
struct FailingSink {
    time_base: Rational,
}

impl PacketSink for FailingSink {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn write_packet(&mut self, _packet: &EncodedPacket) -> Result<()> {
        Err(CastError::Mux("No space left on device".into()))
    }

    fn finalize(&mut self) -> Result<u64> {
        Ok(0)
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        target: TargetSelector::new("fake"),
        strategy: BufferStrategy::Heap,
        transfer_slices: 0,
    }
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

/// 10 fps for one simulated second: exactly 10 frames captured, all of
/// them written, in capture order.
#[test]
fn full_session_at_ten_fps_writes_ten_frames() {
    let written = Arc::new(Mutex::new(Vec::new()));
    let sink = CollectingSink {
        time_base: Rational::per_frame(10),
        written: Arc::clone(&written),
    };

    let report = record(
        FakeBackend { fail_open: false },
        session_config(),
        RecorderConfig {
            fps: 10,
            duration_us: 1_000_000,
            pool_slots: 16,
        },
        Arc::new(SimClock::new()),
        move |geometry| {
            assert_eq!((geometry.width, geometry.height), (4, 2));
            Ok(WriterParts {
                scaler: Box::new(PassthroughScaler),
                encoder: Box::new(RawEncoder::new(10)),
                sink: Box::new(sink),
            })
        },
    )
    .unwrap();

    assert_eq!(report.frames_captured, 10);
    assert_eq!(report.frames_dropped, 0);
    assert_eq!(report.frames_written, 10);

    let written = written.lock().unwrap();
    assert_eq!(written.len(), 10);
    for (i, packet) in written.iter().enumerate() {
        assert_eq!(packet.pts, i as i64);
        // Grab order survives the queue and the writer.
        assert_eq!(packet.data, vec![(i + 1) as u8; 32]);
    }
}

#[test]
fn open_failure_surfaces_without_building_the_writer() {
    let err = record(
        FakeBackend { fail_open: true },
        session_config(),
        RecorderConfig {
            fps: 10,
            duration_us: 1_000_000,
            pool_slots: 16,
        },
        Arc::new(SimClock::new()),
        |_geometry| -> Result<WriterParts> {
            panic!("writer parts must not be built when open fails");
        },
    )
    .unwrap_err();
    assert!(matches!(err, CastError::TargetNotFound(_)));
}

/// Writer fed 5 units through an encoder that buffers 2: all 5 packets are
/// written in submission order, the last two by the final flush.
#[test]
fn encoder_lag_is_drained_by_the_final_flush() {
    let pool = FrameSlotPool::new(8);
    let buffers = BufferBackend::new(BufferStrategy::Heap, 8, 0);
    let queue = HandoffQueue::new();

    for seq in 1..=5u64 {
        let mut claim = pool.acquire().unwrap();
        let mut buf = PixelBuffer::heap(8);
        buf.as_mut_slice().fill(seq as u8);
        pool.store(&mut claim, buf);
        queue.push(CapturedUnit {
            claim,
            pts_us: seq as i64 * 100_000,
            duration_us: 100_000,
            seq,
        });
    }

    let written = Arc::new(Mutex::new(Vec::new()));
    let mut writer = WriterPipeline::new(
        Box::new(PassthroughScaler),
        Box::new(BufferingEncoder::new(2, 10)),
        Box::new(CollectingSink {
            time_base: Rational::per_frame(10),
            written: Arc::clone(&written),
        }),
    );

    let run = AtomicBool::new(false);
    let total = writer.run(&pool, &buffers, &queue, &run).unwrap();
    assert_eq!(total, 5);

    let written = written.lock().unwrap();
    let order: Vec<u8> = written.iter().map(|p| p.data[0]).collect();
    assert_eq!(order, vec![1, 2, 3, 4, 5]);
    assert_eq!(written[0].pts, 0);
    assert_eq!(written[4].pts, 4);
}

/// A writer that dies mid-session must stop the capture side too: with a
/// tiny pool and no consumer left, the capture thread would otherwise spin
/// on slot acquisition with the run flag still set and the session would
/// never return.
#[test]
fn writer_failure_stops_the_capture_side() {
    let err = record(
        FakeBackend { fail_open: false },
        session_config(),
        RecorderConfig {
            fps: 10,
            duration_us: 10_000_000,
            pool_slots: 2,
        },
        Arc::new(SimClock::new()),
        |_geometry| {
            Ok(WriterParts {
                scaler: Box::new(PassthroughScaler),
                encoder: Box::new(RawEncoder::new(10)),
                sink: Box::new(FailingSink {
                    time_base: Rational::per_frame(10),
                }),
            })
        },
    )
    .unwrap_err();
    assert!(matches!(err, CastError::Mux(_)));
}

/// Buffer backend wrapper whose third obtain reports exhaustion.
struct FailOnThird {
    inner: BufferBackend,
    calls: AtomicU64,
}

impl FrameBuffers for FailOnThird {
    fn acquire_frame(
        &self,
        len: usize,
        session: &mut dyn CaptureSession,
    ) -> Result<Option<PixelBuffer>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
            return Ok(None);
        }
        self.inner.acquire_frame(len, session)
    }

    fn release(&self, token: ReleaseToken) {
        self.inner.release(token)
    }
}

/// Obtain failing on tick #3 of 5: units 1, 2, 4, 5 are delivered and
/// unit 3 is dropped, without disturbing the cadence of the others.
#[test]
fn obtain_failure_drops_exactly_that_tick() {
    let mut source = CaptureSource::new(FakeBackend { fail_open: false }, session_config(), 10);
    let geometry = source.open().unwrap();
    let buffers = FailOnThird {
        inner: BufferBackend::new(BufferStrategy::Heap, geometry.frame_len(), 0),
        calls: AtomicU64::new(0),
    };

    let pool = FrameSlotPool::new(16);
    let queue = HandoffQueue::new();
    let run = AtomicBool::new(true);
    let clock = SimClock::new();

    let stats = source
        .run(&pool, &buffers, &queue, &run, &clock, 500_000)
        .unwrap();
    assert_eq!(stats.captured, 4);
    assert_eq!(stats.dropped, 1);

    let mut seqs = Vec::new();
    while let Some(mut unit) = queue.pop(std::time::Duration::from_millis(1)) {
        // Surviving units keep their original pacing anchors.
        assert_eq!(unit.pts_us, unit.seq as i64 * 100_000);
        seqs.push(unit.seq);
        let buf = pool.take(&mut unit.claim).unwrap();
        buffers.release(buf.into_token());
        pool.release(unit.claim);
    }
    assert_eq!(seqs, vec![1, 2, 4, 5]);

    source.close();
}
