//! Process-wide channel for errors the capture environment reports
//! out-of-band (an asynchronous callback, not a return code).
//!
//! Usage pattern: the open sequence calls [`take`] immediately after each
//! sensitive resource-creation call.  A pending message converts into a
//! fatal open error; the act of reading clears the channel so stale errors
//! never accumulate.
//!
//! Global by necessity: the environment's error callback carries no session
//! context.  Only one capture session exists at a time, but the cell is
//! still guarded as a single critical section.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Bound on the stored message; longer reports are truncated.
const MESSAGE_CAP: usize = 256;

struct EnvErrorChannel {
    pending: AtomicBool,
    message: Mutex<String>,
}

static CHANNEL: EnvErrorChannel = EnvErrorChannel {
    pending: AtomicBool::new(false),
    message: Mutex::new(String::new()),
};

/// Record an asynchronous environment error.  Called from the environment's
/// error callback; a second report before the first is taken overwrites it
/// (last error wins, matching the environment's own semantics).
pub fn record(message: &str) {
    let mut slot = CHANNEL.message.lock().expect("error channel poisoned");
    slot.clear();
    if message.len() > MESSAGE_CAP {
        let mut end = MESSAGE_CAP;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        slot.push_str(&message[..end]);
    } else {
        slot.push_str(message);
    }
    CHANNEL.pending.store(true, Ordering::Release);
}

/// Check-and-clear: returns the pending message, if any, and resets the
/// channel.  Called after every sensitive environment call.
pub fn take() -> Option<String> {
    if !CHANNEL.pending.swap(false, Ordering::AcqRel) {
        return None;
    }
    let mut slot = CHANNEL.message.lock().expect("error channel poisoned");
    Some(std::mem::take(&mut *slot))
}
