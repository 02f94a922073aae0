//! Capture side of the pipeline.
//!
//! - [`CaptureBackend`] / [`CaptureSession`] — the contract a concrete grab
//!   implementation satisfies (the X11/composite backend behind the
//!   `x11-grab` feature, fakes in tests).
//! - [`source`] — the paced producer loop and its lifecycle state machine.
//! - [`error_channel`] — process-wide sink for errors the environment
//!   reports out-of-band.

pub mod error_channel;
pub mod source;

#[cfg(feature = "x11-grab")]
pub mod x11;
#[cfg(not(feature = "x11-grab"))]
#[path = "x11_stub.rs"]
pub mod x11;

pub use source::{CaptureSource, CaptureStats, Clock, SystemClock};

use crate::core::buffers::{BufferStrategy, GpuTransfer};
use crate::core::types::Geometry;
use crate::error::Result;

/// How the capture target is selected: first window whose name contains
/// `pattern` wins.  "Not found" is a hard open failure, never retried.
#[derive(Clone, Debug)]
pub struct TargetSelector {
    pub pattern: String,
}

impl TargetSelector {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }
}

/// Per-session open parameters handed to the backend.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub target: TargetSelector,
    pub strategy: BufferStrategy,
    /// Transfer slice count for the GPU-mapped strategy; ignored otherwise.
    pub transfer_slices: usize,
}

/// Lifecycle of a capture source.  Errors during `Opening` tear down and
/// return to `Closed`; there is no partial state observable from outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Closed,
    Opening,
    Ready,
    Capturing,
}

/// One open capture session.
///
/// Deliberately not `Send`: the session may own a GPU context bound to the
/// thread that created it, so sessions are constructed and used on the
/// capture thread only.
pub trait CaptureSession {
    /// Target geometry, read once at open and fixed for the session.
    fn geometry(&self) -> Geometry;

    /// Read one frame of RGBA pixels into `dst`.  Used by the heap and slab
    /// strategies; `dst.len()` equals `geometry().frame_len()`.
    fn grab_into(&mut self, dst: &mut [u8]) -> Result<()>;

    /// Access the GPU transfer slices, when the session was opened with the
    /// GPU-mapped strategy.
    fn transfer(&mut self) -> Option<&mut dyn GpuTransfer>;

    /// Release the resource chain in exact reverse acquisition order.
    /// Idempotent: safe from any partially-built state and safe to call
    /// more than once.
    fn close(&mut self);
}

/// Factory for capture sessions.  Implementations are cheap to construct;
/// the expensive resource acquisition all happens in `open`.
pub trait CaptureBackend {
    type Session: CaptureSession;

    fn open(&mut self, config: &SessionConfig) -> Result<Self::Session>;
}

// ─── Ordered teardown ───────────────────────────────────────────────────────

/// Deferred-cleanup list: every acquired resource registers a labelled
/// release step, and `teardown` runs them in reverse acquisition order.
///
/// This replaces per-failure-branch cleanup: any error during open calls
/// `teardown` once and gets exactly the right partial unwind.  An empty
/// stack makes `teardown` a no-op, which is what makes close idempotent.
pub struct TeardownStack {
    steps: Vec<(&'static str, Box<dyn FnOnce()>)>,
}

impl Default for TeardownStack {
    fn default() -> Self {
        Self::new()
    }
}

impl TeardownStack {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Register a release step for a just-acquired resource.
    pub fn defer(&mut self, label: &'static str, step: impl FnOnce() + 'static) {
        self.steps.push((label, Box::new(step)));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run all registered steps, newest first, emptying the stack.
    pub fn teardown(&mut self) {
        while let Some((label, step)) = self.steps.pop() {
            tracing::debug!(step = label, "releasing capture resource");
            step();
        }
    }
}

impl Drop for TeardownStack {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn teardown_runs_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = TeardownStack::new();
        for step in 1..=4u32 {
            let order = Arc::clone(&order);
            stack.defer("step", move || order.lock().unwrap().push(step));
        }
        stack.teardown();
        assert_eq!(*order.lock().unwrap(), vec![4, 3, 2, 1]);
    }

    #[test]
    fn teardown_twice_is_a_no_op_the_second_time() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut stack = TeardownStack::new();
        {
            let runs = Arc::clone(&runs);
            stack.defer("once", move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        stack.teardown();
        stack.teardown();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(stack.is_empty());
    }

    #[test]
    fn drop_releases_whatever_was_acquired() {
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let mut stack = TeardownStack::new();
            let runs = Arc::clone(&runs);
            stack.defer("leaked-by-error-path", move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
