//! Segregated-fit dynamic memory allocator.
//!
//! `smalloc` manages a single contiguous, monotonically growing heap region.
//! Blocks carry packed boundary tags (size plus three status bits in one
//! word), free blocks are indexed by fifteen size-class buckets, placement
//! runs a bounded best-of-k search and every release eagerly coalesces with
//! the physical neighbors. Freed 16-byte "mini" blocks keep a single list
//! pointer and no footer, so the minimum allocation wastes nothing.
//!
//! The engine itself is [`SegFitAllocator`]; this module adds the
//! process-wide instance plus the [`GlobalAlloc`] facades over it.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::err::CanFail;
use crate::mem::region::{FixedRegion, HeapRegion};
use crate::mem::{HeapAddr, MemoryError};

mod check;
mod heap;
mod seglist;
mod tag;

pub use heap::{HeapStats, SegFitAllocator};

/// Largest payload alignment the allocator guarantees.
const MAX_PAYLOAD_ALIGN: usize = 16;

static SEG_FIT_ALLOCATOR: OnceCell<Mutex<SegFitAllocator<FixedRegion>>> = OnceCell::uninit();

/// Initializes the process-wide allocator over a caller-supplied buffer.
///
/// Should only be run once; later calls fail with
/// [`MemoryError::AlreadyInitialized`] and leave the live heap untouched.
///
/// # Safety
///
/// `base` must point to a writable, 16-byte aligned buffer of at least
/// `capacity` bytes that stays valid for the rest of the process and is not
/// accessed through any other path.
pub unsafe fn init(base: *mut u8, capacity: usize) -> CanFail<MemoryError> {
    if SEG_FIT_ALLOCATOR.is_initialized() {
        return Err(MemoryError::AlreadyInitialized);
    }

    let allocator = SegFitAllocator::init(FixedRegion::new(base, capacity)?)?;

    SEG_FIT_ALLOCATOR
        .try_init_once(|| Mutex::new(allocator))
        .map_err(|_| MemoryError::AlreadyInitialized)
}

/// Allocates `size` bytes from the process-wide allocator.
///
/// Returns a null pointer when `size` is zero, when the heap is exhausted or
/// when [`init`] has not run yet.
pub fn allocate(size: usize) -> *mut u8 {
    match SEG_FIT_ALLOCATOR.get() {
        Some(allocator) => allocator.lock().allocate(size).as_mut_ptr::<u8>(),
        None => ptr::null_mut(),
    }
}

/// Releases an allocation made by the process-wide allocator. No-op on null.
///
/// # Safety
///
/// `payload` must be null or a pointer previously returned by [`allocate`],
/// [`reallocate`] or [`callocate`] and not released since.
pub unsafe fn release(payload: *mut u8) {
    if let Some(allocator) = SEG_FIT_ALLOCATOR.get() {
        allocator.lock().release(HeapAddr::from_ptr(payload));
    }
}

/// Resizes an allocation made by the process-wide allocator.
///
/// # Safety
///
/// Same contract as [`release`].
pub unsafe fn reallocate(payload: *mut u8, size: usize) -> *mut u8 {
    match SEG_FIT_ALLOCATOR.get() {
        Some(allocator) => allocator
            .lock()
            .reallocate(HeapAddr::from_ptr(payload), size)
            .as_mut_ptr::<u8>(),
        None => ptr::null_mut(),
    }
}

/// Allocates a zero-filled array of `count` elements of `elem_size` bytes
/// from the process-wide allocator.
///
/// Returns a null pointer when `count * elem_size` overflows.
pub fn callocate(count: usize, elem_size: usize) -> *mut u8 {
    match SEG_FIT_ALLOCATOR.get() {
        Some(allocator) => allocator
            .lock()
            .callocate(count, elem_size)
            .as_mut_ptr::<u8>(),
        None => ptr::null_mut(),
    }
}

/// Runs the consistency sweep on the process-wide allocator.
///
/// `tag` identifies the call site in failure reports, conventionally
/// `line!()`. Returns `false` when the allocator is not initialized.
pub fn check_heap(tag: u32) -> bool {
    match SEG_FIT_ALLOCATOR.get() {
        Some(allocator) => allocator.lock().check_heap(tag),
        None => false,
    }
}

/// Usage counters of the process-wide allocator.
pub fn stats() -> Result<HeapStats, MemoryError> {
    match SEG_FIT_ALLOCATOR.get() {
        Some(allocator) => Ok(allocator.lock().stats()),
        None => Err(MemoryError::Uninitialized),
    }
}

/// [`GlobalAlloc`] facade over the process-wide allocator.
///
/// Requests with an alignment above 16 are refused with a null pointer: the
/// heap only guarantees payload alignment, never page-level alignment.
pub struct SyncSegFitAllocator {}

impl SyncSegFitAllocator {
    pub const fn new() -> Self {
        Self {}
    }
}

unsafe impl GlobalAlloc for SyncSegFitAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_PAYLOAD_ALIGN {
            return ptr::null_mut();
        }

        allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        release(ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_PAYLOAD_ALIGN {
            return ptr::null_mut();
        }

        callocate(layout.size(), 1)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MAX_PAYLOAD_ALIGN {
            return ptr::null_mut();
        }

        reallocate(ptr, new_size)
    }
}

/// Locked version of the [`SegFitAllocator`], for a locally-owned heap.
///
/// It uses a spinlock-based Mutex to ensure interior mutability, making the
/// engine usable behind the `#[global_allocator]` attribute without the
/// process-wide instance.
pub struct LockedSegFitAllocator<R: HeapRegion> {
    pub alloc: Mutex<SegFitAllocator<R>>,
}

impl<R: HeapRegion> LockedSegFitAllocator<R> {
    pub fn new(region: R) -> Result<Self, MemoryError> {
        Ok(Self {
            alloc: Mutex::new(SegFitAllocator::init(region)?),
        })
    }
}

unsafe impl<R: HeapRegion> GlobalAlloc for LockedSegFitAllocator<R> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_PAYLOAD_ALIGN {
            return ptr::null_mut();
        }

        self.alloc.lock().allocate(layout.size()).as_mut_ptr::<u8>()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.alloc.lock().release(HeapAddr::from_ptr(ptr));
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_PAYLOAD_ALIGN {
            return ptr::null_mut();
        }

        self.alloc
            .lock()
            .callocate(layout.size(), 1)
            .as_mut_ptr::<u8>()
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MAX_PAYLOAD_ALIGN {
            return ptr::null_mut();
        }

        self.alloc
            .lock()
            .reallocate(HeapAddr::from_ptr(ptr), new_size)
            .as_mut_ptr::<u8>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_allocator_serves_layouts() {
        let capacity = 1 << 16;
        let layout = std::alloc::Layout::from_size_align(capacity, 16).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };

        let region = unsafe { FixedRegion::new(base, capacity).unwrap() };
        let allocator = LockedSegFitAllocator::new(region).unwrap();

        unsafe {
            let small = Layout::from_size_align(24, 8).unwrap();
            let p = allocator.alloc(small);
            assert!(!p.is_null());
            assert_eq!(p as usize % 16, 0);

            let zeroed = allocator.alloc_zeroed(Layout::from_size_align(64, 16).unwrap());
            assert!(!zeroed.is_null());
            for i in 0..64 {
                assert_eq!(*zeroed.add(i), 0);
            }

            let over_aligned = Layout::from_size_align(64, 64).unwrap();
            assert!(allocator.alloc(over_aligned).is_null());

            allocator.dealloc(p, small);
            assert!(allocator.alloc.lock().check_heap(line!()));
        }
    }

    #[test]
    fn process_wide_allocator_round_trip() {
        // The one test touching the process-wide instance; everything else
        // builds its own engine so tests stay independent.
        assert!(allocate(16).is_null());
        assert!(!check_heap(line!()));
        assert!(stats().is_err());

        let capacity = 1 << 16;
        let layout = std::alloc::Layout::from_size_align(capacity, 16).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };

        unsafe {
            init(base, capacity).unwrap();
            assert_eq!(
                init(base, capacity),
                Err(MemoryError::AlreadyInitialized)
            );

            let p = allocate(100);
            assert!(!p.is_null());
            assert_eq!(p as usize % 16, 0);

            let q = callocate(4, 25);
            assert!(!q.is_null());
            for i in 0..100 {
                assert_eq!(*q.add(i), 0);
            }

            let r = reallocate(p, 200);
            assert!(!r.is_null());

            // The GlobalAlloc facade serves from the same heap.
            let facade = SyncSegFitAllocator::new();
            let s = facade.alloc(Layout::from_size_align(32, 16).unwrap());
            assert!(!s.is_null());
            facade.dealloc(s, Layout::from_size_align(32, 16).unwrap());

            release(r);
            release(q);
            assert!(check_heap(line!()));
            assert_eq!(stats().unwrap().free_blocks, 1);
        }
    }
}
