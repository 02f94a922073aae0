//! Buffer backends — three interchangeable strategies for sourcing the raw
//! pixel bytes attached to a captured unit.
//!
//! | Strategy    | obtain                                   | backpressure |
//! |-------------|------------------------------------------|--------------|
//! | `Heap`      | fresh allocation per frame               | never fails  |
//! | `Slab`      | CAS-claim one of M pre-allocated buffers | `None` when exhausted |
//! | `GpuMapped` | CAS-claim a GPU transfer slice, begin an async device read, map synchronously | `None` when exhausted |
//!
//! All three present the same contract to the capture loop through
//! [`FrameBuffers`], so no strategy branching leaks into the tick path.  An
//! exhausted pool is the backpressure signal: the producer skips the frame
//! and warns, it never blocks the capture cadence.
//!
//! Release is keyed by an opaque [`ReleaseToken`] carried inside the
//! [`PixelBuffer`]; the caller returns the buffer without knowing the
//! strategy.  Releasing a slice that is not claimed is fatal, exactly like
//! the frame slot pool.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::capture::CaptureSession;
use crate::error::{CastError, Result};

/// Default number of slab / GPU transfer slices per session.  Fixed policy,
/// independent of the frame slot pool size.
pub const DEFAULT_SLAB_SLICES: usize = 8;

// ─── Strategy selector ──────────────────────────────────────────────────────

/// Which backend a session uses.  Chosen once at open, fixed thereafter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferStrategy {
    Heap,
    Slab,
    GpuMapped,
}

impl BufferStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "heap" => Ok(Self::Heap),
            "slab" => Ok(Self::Slab),
            "gpu" | "gpu-mapped" | "pbo" => Ok(Self::GpuMapped),
            other => Err(CastError::Pipeline(format!(
                "Unknown buffer strategy '{other}'. Use heap, slab or gpu-mapped."
            ))),
        }
    }
}

// ─── Pixel buffer + release token ───────────────────────────────────────────

/// Opaque ownership token returned by `obtain` and consumed by `release`.
/// Carries enough context to return the bytes to the right pool slice.
#[derive(Debug)]
pub enum ReleaseToken {
    /// Owns the allocation; dropping it frees the frame.
    Heap(Box<[u8]>),
    /// Index of the claimed slab slice.
    Slab(usize),
    /// Index of the claimed GPU transfer slice.
    Gpu(usize),
}

/// One frame's worth of pixel bytes, backed by whichever strategy produced
/// it.  The pointer is valid until the token is released, and the holder of
/// the buffer is the sole claimant of the backing slice.
#[derive(Debug)]
pub struct PixelBuffer {
    ptr: NonNull<u8>,
    len: usize,
    token: ReleaseToken,
}

// SAFETY: a PixelBuffer is the unique claimant of its backing bytes (heap
// allocation or CAS-claimed slice), so moving it to the consumer thread
// cannot introduce aliased writes.
unsafe impl Send for PixelBuffer {}

impl PixelBuffer {
    /// Fresh heap-backed buffer of `len` zeroed bytes.
    pub fn heap(len: usize) -> Self {
        let mut buf = vec![0u8; len].into_boxed_slice();
        // SAFETY: a boxed slice allocation is non-null; the box lives in the
        // token, so the pointer stays valid until release.
        let ptr = unsafe { NonNull::new_unchecked(buf.as_mut_ptr()) };
        Self {
            ptr,
            len,
            token: ReleaseToken::Heap(buf),
        }
    }

    fn from_raw(ptr: NonNull<u8>, len: usize, token: ReleaseToken) -> Self {
        Self { ptr, len, token }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe the claimed backing bytes; see `Send`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: exclusive access through &mut self on the unique claimant.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Consume the buffer, keeping only what `release` needs.
    pub fn into_token(self) -> ReleaseToken {
        self.token
    }
}

// ─── GPU transfer seam ──────────────────────────────────────────────────────

/// Asynchronous device→buffer transfer slices, owned by the capture session
/// (the GPU context is bound to the capture thread; the writer never calls
/// into this).
pub trait GpuTransfer {
    /// Issue the asynchronous device read into slice `index`.
    fn begin_read(&mut self, index: usize) -> Result<()>;
    /// Synchronously map slice `index`; the returned pointer is valid until
    /// `unmap` of the same slice.
    fn map(&mut self, index: usize) -> Result<(NonNull<u8>, usize)>;
    /// Undo a previous `map`.  Must be called before the slice is reused.
    fn unmap(&mut self, index: usize);
}

// ─── Uniform obtain/release contract ────────────────────────────────────────

/// Strategy-agnostic view of a buffer backend, as seen by the capture tick
/// (`acquire_frame`) and the writer (`release`).
pub trait FrameBuffers: Send + Sync {
    /// Claim backing storage for one `len`-byte frame and fill it from the
    /// session.  `Ok(None)` is the backpressure signal (all slices claimed);
    /// the caller skips the frame and must not block.
    fn acquire_frame(
        &self,
        len: usize,
        session: &mut dyn CaptureSession,
    ) -> Result<Option<PixelBuffer>>;

    /// Return one frame's backing storage to the pool.
    fn release(&self, token: ReleaseToken);
}

// ─── Backend implementation ─────────────────────────────────────────────────

/// Cache-line sized claim flag pair for one pooled slice.
#[repr(align(64))]
struct SlabSlice {
    claimed: AtomicBool,
    storage: UnsafeCell<Box<[u8]>>,
}

// SAFETY: `storage` is only accessed by the thread holding the CAS claim.
unsafe impl Sync for SlabSlice {}

#[repr(align(64))]
struct TransferSlice {
    claimed: AtomicBool,
    /// Whether the slice still carries a live mapping from its previous use.
    /// Written only on the capture thread; the atomic makes the backend Sync.
    mapped: AtomicBool,
}

/// The session's buffer backend.  A closed set of strategies selected at
/// open time; see the module docs for the per-strategy contract.  The
/// variants live in a private enum so the slice pool types stay out of the
/// public surface.
pub struct BufferBackend {
    inner: Backend,
}

enum Backend {
    Heap,
    Slab { slices: Box<[SlabSlice]> },
    GpuMapped { slices: Box<[TransferSlice]> },
}

impl BufferBackend {
    /// Allocate the backend pool for one session.
    ///
    /// `frame_len` sizes each slab slice; `slices` is M (default 8) for the
    /// pooled strategies and ignored for `Heap`.
    pub fn new(strategy: BufferStrategy, frame_len: usize, slices: usize) -> Self {
        let inner = match strategy {
            BufferStrategy::Heap => Backend::Heap,
            BufferStrategy::Slab => {
                let slices = (0..slices.max(1))
                    .map(|_| SlabSlice {
                        claimed: AtomicBool::new(false),
                        storage: UnsafeCell::new(vec![0u8; frame_len].into_boxed_slice()),
                    })
                    .collect::<Vec<_>>()
                    .into_boxed_slice();
                tracing::debug!(
                    slices = slices.len(),
                    slice_bytes = frame_len,
                    "slab buffer pool allocated"
                );
                Backend::Slab { slices }
            }
            BufferStrategy::GpuMapped => {
                let slices = (0..slices.max(1))
                    .map(|_| TransferSlice {
                        claimed: AtomicBool::new(false),
                        mapped: AtomicBool::new(false),
                    })
                    .collect::<Vec<_>>()
                    .into_boxed_slice();
                Backend::GpuMapped { slices }
            }
        };
        Self { inner }
    }

    pub fn strategy(&self) -> BufferStrategy {
        match self.inner {
            Backend::Heap => BufferStrategy::Heap,
            Backend::Slab { .. } => BufferStrategy::Slab,
            Backend::GpuMapped { .. } => BufferStrategy::GpuMapped,
        }
    }
}

fn cas_claim(claimed: &AtomicBool) -> bool {
    claimed
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
}

fn cas_release(claimed: &AtomicBool, what: &str, index: usize) {
    if claimed
        .compare_exchange(true, false, Ordering::Release, Ordering::Relaxed)
        .is_err()
    {
        tracing::error!(index, "release of an unclaimed {what} slice");
        panic!("{what} slice {index} released while free");
    }
}

impl FrameBuffers for BufferBackend {
    fn acquire_frame(
        &self,
        len: usize,
        session: &mut dyn CaptureSession,
    ) -> Result<Option<PixelBuffer>> {
        match &self.inner {
            Backend::Heap => {
                let mut buf = PixelBuffer::heap(len);
                session.grab_into(buf.as_mut_slice())?;
                Ok(Some(buf))
            }
            Backend::Slab { slices } => {
                let Some(index) = slices.iter().position(|s| cas_claim(&s.claimed)) else {
                    return Ok(None);
                };
                let slice = &slices[index];
                // SAFETY: we hold the claim on this slice.
                let storage = unsafe { &mut *slice.storage.get() };
                debug_assert!(storage.len() >= len, "slab slice smaller than frame");
                if let Err(e) = session.grab_into(&mut storage[..len]) {
                    cas_release(&slice.claimed, "slab", index);
                    return Err(e);
                }
                // SAFETY: boxed-slice storage is non-null and its address is
                // stable; the claim keeps it exclusively ours until release.
                let ptr = unsafe { NonNull::new_unchecked(storage.as_mut_ptr()) };
                Ok(Some(PixelBuffer::from_raw(ptr, len, ReleaseToken::Slab(index))))
            }
            Backend::GpuMapped { slices } => {
                let Some(index) = slices.iter().position(|s| cas_claim(&s.claimed)) else {
                    return Ok(None);
                };
                let slice = &slices[index];
                let transfer = match session.transfer() {
                    Some(t) => t,
                    None => {
                        cas_release(&slice.claimed, "transfer", index);
                        return Err(CastError::ResourceAlloc(
                            "gpu-mapped strategy selected but the session has no transfer buffers"
                                .into(),
                        ));
                    }
                };
                // A slice released by the consumer may still be mapped; the
                // unmap happens here, on the GPU-owning thread, before reuse.
                if slice.mapped.swap(false, Ordering::AcqRel) {
                    transfer.unmap(index);
                }
                let step = (|| {
                    transfer.begin_read(index)?;
                    transfer.map(index)
                })();
                let (ptr, cap) = match step {
                    Ok(ok) => ok,
                    Err(e) => {
                        cas_release(&slice.claimed, "transfer", index);
                        return Err(e);
                    }
                };
                slice.mapped.store(true, Ordering::Release);
                if cap < len {
                    transfer.unmap(index);
                    slice.mapped.store(false, Ordering::Release);
                    cas_release(&slice.claimed, "transfer", index);
                    return Err(CastError::ResourceAlloc(format!(
                        "transfer slice {index} maps {cap} bytes, frame needs {len}"
                    )));
                }
                Ok(Some(PixelBuffer::from_raw(ptr, len, ReleaseToken::Gpu(index))))
            }
        }
    }

    fn release(&self, token: ReleaseToken) {
        match (&self.inner, token) {
            (Backend::Heap, ReleaseToken::Heap(buf)) => drop(buf),
            (Backend::Slab { slices }, ReleaseToken::Slab(index)) => {
                cas_release(&slices[index].claimed, "slab", index);
            }
            // Only the claim is freed here; the mapping is undone on the
            // capture thread at the next reuse (the writer never issues GPU
            // calls) and at session close.
            (Backend::GpuMapped { slices }, ReleaseToken::Gpu(index)) => {
                cas_release(&slices[index].claimed, "transfer", index);
            }
            (_, token) => {
                tracing::error!(strategy = ?self.strategy(), ?token, "foreign release token");
                panic!("release token does not belong to this backend");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Geometry;

    /// Session double producing a fixed byte pattern, with a fake GPU
    /// transfer pool that records the order of begin/map/unmap calls.
    struct FakeSession {
        fill: u8,
        transfer: FakeTransfer,
    }

    struct FakeTransfer {
        storage: Vec<Box<[u8]>>,
        ops: Vec<(String, usize)>,
        fill: u8,
    }

    impl GpuTransfer for FakeTransfer {
        fn begin_read(&mut self, index: usize) -> Result<()> {
            self.storage[index].fill(self.fill);
            self.ops.push(("begin".into(), index));
            Ok(())
        }

        fn map(&mut self, index: usize) -> Result<(NonNull<u8>, usize)> {
            self.ops.push(("map".into(), index));
            let s = &mut self.storage[index];
            Ok((NonNull::new(s.as_mut_ptr()).unwrap(), s.len()))
        }

        fn unmap(&mut self, index: usize) {
            self.ops.push(("unmap".into(), index));
        }
    }

    impl CaptureSession for FakeSession {
        fn geometry(&self) -> Geometry {
            Geometry::new(2, 2, 24)
        }

        fn grab_into(&mut self, dst: &mut [u8]) -> Result<()> {
            dst.fill(self.fill);
            Ok(())
        }

        fn transfer(&mut self) -> Option<&mut dyn GpuTransfer> {
            Some(&mut self.transfer)
        }

        fn close(&mut self) {}
    }

    fn fake_session(fill: u8, slices: usize, len: usize) -> FakeSession {
        FakeSession {
            fill,
            transfer: FakeTransfer {
                storage: (0..slices).map(|_| vec![0u8; len].into_boxed_slice()).collect(),
                ops: Vec::new(),
                fill,
            },
        }
    }

    #[test]
    fn heap_always_obtains() {
        let backend = BufferBackend::new(BufferStrategy::Heap, 16, 0);
        let mut sess = fake_session(0xAB, 0, 16);
        for _ in 0..32 {
            let buf = backend.acquire_frame(16, &mut sess).unwrap().unwrap();
            assert_eq!(buf.as_slice(), &[0xAB; 16]);
            backend.release(buf.into_token());
        }
    }

    #[test]
    fn slab_exhaustion_is_deterministic_and_recovers() {
        let backend = BufferBackend::new(BufferStrategy::Slab, 8, 2);
        let mut sess = fake_session(0x5A, 0, 8);

        let a = backend.acquire_frame(8, &mut sess).unwrap().unwrap();
        let b = backend.acquire_frame(8, &mut sess).unwrap().unwrap();
        // All M claimed: obtain fails without blocking, deterministically.
        assert!(backend.acquire_frame(8, &mut sess).unwrap().is_none());
        assert!(backend.acquire_frame(8, &mut sess).unwrap().is_none());

        backend.release(a.into_token());
        // One release is enough for the next obtain to succeed.
        let c = backend.acquire_frame(8, &mut sess).unwrap().unwrap();
        assert_eq!(c.as_slice(), &[0x5A; 8]);
        backend.release(b.into_token());
        backend.release(c.into_token());
    }

    #[test]
    #[should_panic(expected = "released while free")]
    fn slab_double_release_is_fatal() {
        let backend = BufferBackend::new(BufferStrategy::Slab, 8, 1);
        backend.release(ReleaseToken::Slab(0));
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn foreign_token_is_fatal() {
        let backend = BufferBackend::new(BufferStrategy::Heap, 8, 0);
        backend.release(ReleaseToken::Slab(0));
    }

    #[test]
    fn gpu_slice_is_unmapped_before_reuse() {
        let backend = BufferBackend::new(BufferStrategy::GpuMapped, 8, 1);
        let mut sess = fake_session(0x11, 1, 8);

        let a = backend.acquire_frame(8, &mut sess).unwrap().unwrap();
        assert_eq!(a.as_slice(), &[0x11; 8]);
        backend.release(a.into_token());

        // Reuse of the slice must unmap the stale mapping first.
        let b = backend.acquire_frame(8, &mut sess).unwrap().unwrap();
        backend.release(b.into_token());

        let ops: Vec<&str> = sess.transfer.ops.iter().map(|(op, _)| op.as_str()).collect();
        assert_eq!(ops, vec!["begin", "map", "unmap", "begin", "map"]);
    }

    #[test]
    fn gpu_exhaustion_signals_none() {
        let backend = BufferBackend::new(BufferStrategy::GpuMapped, 8, 1);
        let mut sess = fake_session(0, 1, 8);
        let held = backend.acquire_frame(8, &mut sess).unwrap().unwrap();
        assert!(backend.acquire_frame(8, &mut sess).unwrap().is_none());
        backend.release(held.into_token());
        assert!(backend.acquire_frame(8, &mut sess).unwrap().is_some());
    }
}
