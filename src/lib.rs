//! `smalloc` — a segregated-fit dynamic memory allocator.
//!
//! The allocator manages a single contiguous, monotonically growing heap
//! region handed to it through the [`HeapRegion`] seam, and serves 16-byte
//! aligned payloads out of it with packed boundary tags, fifteen size-class
//! free lists and eager coalescing. See [`mem::smalloc`] for the engine and
//! the `GlobalAlloc` facades.

#![cfg_attr(not(test), no_std)]

pub mod err;
pub mod mem;

pub use err::{BaseError, CanFail};
pub use mem::region::{FixedRegion, HeapRegion};
pub use mem::smalloc::{
    allocate, callocate, check_heap, init, reallocate, release, stats, HeapStats,
    LockedSegFitAllocator, SegFitAllocator, SyncSegFitAllocator,
};
pub use mem::{Alignment, HeapAddr, MemoryError};
