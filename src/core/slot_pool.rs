//! Fixed-capacity, lock-free frame slot pool.
//!
//! The pool hands reusable frame envelopes to the capture thread and
//! reclaims them when the writer is done.  Each slot is independently
//! claimed with a single compare-and-swap; there is no ordering or fairness
//! guarantee among slots — acquisition is first-fit, and callers that need a
//! slot under contention retry (spin or yield) rather than block.
//!
//! A slot is either `free` or `claimed`.  Exactly one thread holds a claimed
//! slot at any time; the claim token ([`SlotClaim`]) is the proof of
//! ownership and is consumed by [`FrameSlotPool::release`].  Releasing a
//! slot that is not claimed is a programming error and aborts rather than
//! silently continuing with a corrupted pool shared across threads.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::buffers::PixelBuffer;

/// Default number of frame slots per session.
pub const DEFAULT_POOL_SLOTS: usize = 16;

/// One frame envelope: a claim flag plus the parked pixel payload.
///
/// Aligned to a cache line so the capture writer and the consumer reader of
/// adjacent slots never false-share.
#[repr(align(64))]
struct Slot {
    claimed: AtomicBool,
    payload: UnsafeCell<Option<PixelBuffer>>,
}

// SAFETY: `payload` is only touched by the thread that won the `claimed`
// CAS, and the acquire/release orderings on the flag order those accesses.
unsafe impl Sync for Slot {}

/// Proof of ownership of one claimed slot.  Not cloneable; consumed by
/// `release`.  Dropping a claim without releasing leaks the slot for the
/// rest of the session.
#[derive(Debug)]
pub struct SlotClaim {
    index: usize,
}

impl SlotClaim {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Fixed-size pool of frame slots.  Slots are created once at construction
/// and never added or removed mid-session.
pub struct FrameSlotPool {
    slots: Box<[Slot]>,
}

impl FrameSlotPool {
    pub fn new(slots: usize) -> Self {
        assert!(slots >= 1, "pool needs at least one slot");
        let slots = (0..slots)
            .map(|_| Slot {
                claimed: AtomicBool::new(false),
                payload: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the first free slot, or `None` when all are claimed.
    pub fn acquire(&self) -> Option<SlotClaim> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .claimed
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(SlotClaim { index });
            }
        }
        None
    }

    /// Return a slot to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not currently claimed — a double release means
    /// the single-claimant invariant is already broken and continuing would
    /// risk two threads writing the same payload.
    pub fn release(&self, claim: SlotClaim) {
        let slot = &self.slots[claim.index];
        if slot
            .claimed
            .compare_exchange(true, false, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            tracing::error!(slot = claim.index, "release of a slot that is not claimed");
            panic!("frame slot {} released while free", claim.index);
        }
    }

    /// Park a pixel payload in a claimed slot.
    pub fn store(&self, claim: &mut SlotClaim, buf: PixelBuffer) {
        // SAFETY: the claim proves exclusive ownership of this slot.
        unsafe { *self.slots[claim.index].payload.get() = Some(buf) };
    }

    /// Borrow the parked payload of a claimed slot, if any.
    pub fn payload<'a>(&'a self, claim: &'a SlotClaim) -> Option<&'a PixelBuffer> {
        // SAFETY: shared access is fine while the claim pins the slot to us.
        unsafe { (*self.slots[claim.index].payload.get()).as_ref() }
    }

    /// Take the parked payload out of a claimed slot.
    pub fn take(&self, claim: &mut SlotClaim) -> Option<PixelBuffer> {
        // SAFETY: the claim proves exclusive ownership of this slot.
        unsafe { (*self.slots[claim.index].payload.get()).take() }
    }

    #[cfg(test)]
    fn claimed_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.claimed.load(Ordering::Relaxed))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn slot_is_cache_line_sized() {
        assert!(std::mem::align_of::<Slot>() >= 64);
        assert!(std::mem::size_of::<Slot>() >= 64);
    }

    #[test]
    fn acquire_exhausts_then_release_recycles() {
        let pool = FrameSlotPool::new(2);
        let a = pool.acquire().expect("slot 0");
        let b = pool.acquire().expect("slot 1");
        assert!(pool.acquire().is_none());
        assert_eq!(pool.claimed_count(), 2);

        pool.release(a);
        let c = pool.acquire().expect("recycled slot");
        assert_eq!(c.index(), 0);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.claimed_count(), 0);
    }

    #[test]
    #[should_panic(expected = "released while free")]
    fn releasing_an_unclaimed_slot_is_fatal() {
        let pool = FrameSlotPool::new(1);
        // Forge a claim that was never acquired.
        pool.release(SlotClaim { index: 0 });
    }

    #[test]
    fn payload_round_trip() {
        let pool = FrameSlotPool::new(1);
        let mut claim = pool.acquire().unwrap();
        assert!(pool.payload(&claim).is_none());

        let mut buf = PixelBuffer::heap(8);
        buf.as_mut_slice().copy_from_slice(&[7u8; 8]);
        pool.store(&mut claim, buf);

        assert_eq!(pool.payload(&claim).unwrap().as_slice(), &[7u8; 8]);
        let out = pool.take(&mut claim).unwrap();
        assert_eq!(out.as_slice(), &[7u8; 8]);
        assert!(pool.take(&mut claim).is_none());
        pool.release(claim);
    }

    /// Two threads hammering acquire/release must never both hold the same
    /// slot: the sum of distinct claims held at any instant never exceeds
    /// capacity, and every claim index is unique among live claims.
    #[test]
    fn two_threads_never_double_claim() {
        let pool = Arc::new(FrameSlotPool::new(4));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    if let Some(mut claim) = pool.acquire() {
                        // Write a marker through the exclusive payload cell;
                        // a double claim would race here under miri/tsan.
                        let mut buf = PixelBuffer::heap(4);
                        buf.as_mut_slice().fill(claim.index() as u8);
                        pool.store(&mut claim, buf);
                        let seen = pool.take(&mut claim).unwrap();
                        assert_eq!(seen.as_slice()[0], claim.index() as u8);
                        pool.release(claim);
                    } else {
                        std::thread::yield_now();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.claimed_count(), 0);
    }
}
