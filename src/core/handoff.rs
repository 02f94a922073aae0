//! Thread-safe FIFO handing completed frames from capture to encode.
//!
//! `push` appends and wakes one waiter; `pop` blocks cooperatively for up to
//! a timeout and then reports "nothing yet" instead of blocking forever —
//! that bounded wait is what lets the consumer notice a shutdown request
//! promptly without busy-polling.
//!
//! Capacity is unbounded; in practice depth is bounded by the upstream slot
//! pool running out of free slots, which throttles the producer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default bounded wait for [`HandoffQueue::pop`].
pub const POP_TIMEOUT: Duration = Duration::from_millis(100);

pub struct HandoffQueue<T> {
    inner: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandoffQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Append an item and wake one waiting consumer.
    pub fn push(&self, item: T) {
        let mut q = self.inner.lock().expect("handoff queue mutex poisoned");
        q.push_back(item);
        self.ready.notify_one();
    }

    /// Pop the oldest item, waiting up to `timeout` for one to arrive.
    /// Returns `None` on timeout.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut q = self.inner.lock().expect("handoff queue mutex poisoned");
        loop {
            if let Some(item) = q.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _timed_out) = self
                .ready
                .wait_timeout(q, deadline - now)
                .expect("handoff queue mutex poisoned");
            q = guard;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("handoff queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
