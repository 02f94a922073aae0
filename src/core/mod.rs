//! Core data structures: frame types, the slot pool, buffer backends and
//! the producer/consumer handoff queue.

pub mod buffers;
pub mod handoff;
pub mod slot_pool;
pub mod types;

pub use buffers::{
    BufferBackend, BufferStrategy, FrameBuffers, GpuTransfer, PixelBuffer, ReleaseToken,
    DEFAULT_SLAB_SLICES,
};
pub use handoff::{HandoffQueue, POP_TIMEOUT};
pub use slot_pool::{FrameSlotPool, SlotClaim, DEFAULT_POOL_SLOTS};
pub use types::{rescale, CapturedUnit, Geometry, PixelFormat, Rational};
