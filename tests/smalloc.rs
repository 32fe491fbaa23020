//! End-to-end tests driving the allocator through its public surface only.

use std::alloc::Layout;

use smalloc::{Alignment, FixedRegion, HeapAddr, LockedSegFitAllocator, SegFitAllocator};

const ARENA_CAPACITY: usize = 1 << 20;

fn fresh_heap() -> SegFitAllocator<FixedRegion> {
    fresh_heap_with(ARENA_CAPACITY)
}

fn fresh_heap_with(capacity: usize) -> SegFitAllocator<FixedRegion> {
    let layout = Layout::from_size_align(capacity, 16).unwrap();
    let base = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!base.is_null());

    let region = unsafe { FixedRegion::new(base, capacity).unwrap() };
    SegFitAllocator::init(region).unwrap()
}

fn fill_in(payload: HeapAddr, len: usize) {
    let ptr = payload.as_mut_ptr::<u8>();
    for i in 0..len {
        unsafe { *ptr.add(i) = (i ^ len) as u8 };
    }
}

fn check_on(payload: HeapAddr, len: usize) {
    let ptr = payload.as_ptr::<u8>();
    for i in 0..len {
        assert_eq!(unsafe { *ptr.add(i) }, (i ^ len) as u8);
    }
}

#[test]
fn payloads_are_aligned_and_disjoint() {
    let mut heap = fresh_heap();
    let mut live: Vec<(HeapAddr, usize)> = Vec::new();

    for size in [1, 7, 8, 9, 16, 24, 100, 512, 4000] {
        let p = heap.allocate(size);
        assert!(!p.is_null());
        assert!(p.is_aligned_with(Alignment::ALIGN_16));

        fill_in(p, size);
        live.push((p, size));

        assert!(heap.check_heap(line!()));
    }

    // Every payload still carries its own pattern: no two live allocations
    // overlap.
    for &(p, size) in &live {
        check_on(p, size);
    }

    for &(p, _) in &live {
        unsafe { heap.release(p) };
        assert!(heap.check_heap(line!()));
    }
}

#[test]
fn alloc_and_free_across_the_size_spectrum() {
    let mut heap = fresh_heap();

    for size in (1..=32).chain(512..=528) {
        let p = heap.allocate(size);
        assert!(!p.is_null());

        fill_in(p, size);
        check_on(p, size);

        unsafe { heap.release(p) };
        assert!(heap.check_heap(line!()));
    }
}

#[test]
fn release_restores_the_free_set() {
    let mut heap = fresh_heap();

    // Pin some fragmentation first so the law is tested on a non-trivial
    // free set.
    let a = heap.allocate(48);
    let b = heap.allocate(96);
    unsafe { heap.release(a) };

    let before = heap.stats();

    let p = heap.allocate(200);
    assert!(!p.is_null());
    unsafe { heap.release(p) };

    assert_eq!(heap.stats(), before);

    unsafe { heap.release(b) };
    assert!(heap.check_heap(line!()));
}

#[test]
fn reallocate_same_size_preserves_contents() {
    let mut heap = fresh_heap();

    let p = heap.allocate(128);
    fill_in(p, 128);

    let q = unsafe { heap.reallocate(p, 128) };
    assert!(!q.is_null());
    check_on(q, 128);

    unsafe { heap.release(q) };
    assert!(heap.check_heap(line!()));
}

#[test]
fn reallocate_shrink_keeps_the_prefix() {
    let mut heap = fresh_heap();

    let p = heap.allocate(256);
    fill_in(p, 256);

    let q = unsafe { heap.reallocate(p, 64) };
    assert!(!q.is_null());

    let ptr = q.as_ptr::<u8>();
    for i in 0..64 {
        assert_eq!(unsafe { *ptr.add(i) }, (i ^ 256) as u8);
    }
}

#[test]
fn reallocate_boundary_cases() {
    let mut heap = fresh_heap();

    // Null payload degenerates to an allocation.
    let p = unsafe { heap.reallocate(HeapAddr::NULL_PTR, 40) };
    assert!(!p.is_null());

    // Zero size degenerates to a release.
    let q = unsafe { heap.reallocate(p, 0) };
    assert!(q.is_null());
    assert!(heap.check_heap(line!()));
}

#[test]
fn callocate_returns_zeroed_memory() {
    let mut heap = fresh_heap();

    // Dirty a block, release it, then callocate over the recycled bytes.
    let dirty = heap.allocate(512);
    fill_in(dirty, 512);
    unsafe { heap.release(dirty) };

    let p = heap.callocate(64, 8);
    assert!(!p.is_null());

    let ptr = p.as_ptr::<u8>();
    for i in 0..512 {
        assert_eq!(unsafe { *ptr.add(i) }, 0);
    }
}

#[test]
fn callocate_overflow_returns_null_without_allocating() {
    let mut heap = fresh_heap();
    let before = heap.stats();

    assert!(heap.callocate(usize::MAX, 2).is_null());
    assert!(heap.callocate(usize::MAX / 2 + 1, 4).is_null());

    assert_eq!(heap.stats(), before);
    assert!(heap.check_heap(line!()));
}

#[test]
fn allocate_zero_and_release_null() {
    let mut heap = fresh_heap();

    assert!(heap.allocate(0).is_null());
    unsafe { heap.release(HeapAddr::NULL_PTR) };
    assert!(heap.check_heap(line!()));
}

#[test]
fn heap_exhaustion_surfaces_as_null() {
    let mut heap = fresh_heap_with(16 + 4096);

    // The region cannot grow past its capacity; an oversized request must
    // fail cleanly and leave the heap usable.
    assert!(heap.allocate(1 << 20).is_null());
    assert!(heap.check_heap(line!()));

    let p = heap.allocate(64);
    assert!(!p.is_null());
}

#[test]
fn churn_keeps_the_heap_consistent() {
    let mut heap = fresh_heap();
    let mut live: Vec<(HeapAddr, usize)> = Vec::new();

    // Deterministic alloc/free churn with verification of survivors.
    for round in 0..200usize {
        let size = 1 + (round * 37) % 700;
        let p = heap.allocate(size);
        assert!(!p.is_null());
        fill_in(p, size);
        live.push((p, size));

        if round % 3 == 0 {
            let (victim, victim_size) = live.swap_remove((round * 7) % live.len());
            check_on(victim, victim_size);
            unsafe { heap.release(victim) };
        }
    }

    assert!(heap.check_heap(line!()));

    for &(p, size) in &live {
        check_on(p, size);
    }
    for &(p, _) in &live {
        unsafe { heap.release(p) };
    }

    assert!(heap.check_heap(line!()));
    assert_eq!(heap.stats().free_blocks, 1);
}

#[test]
fn locked_facade_works_as_a_global_allocator_backend() {
    let layout = Layout::from_size_align(ARENA_CAPACITY, 16).unwrap();
    let base = unsafe { std::alloc::alloc_zeroed(layout) };

    let region = unsafe { FixedRegion::new(base, ARENA_CAPACITY).unwrap() };
    let allocator = LockedSegFitAllocator::new(region).unwrap();

    use std::alloc::GlobalAlloc;

    unsafe {
        let layout = Layout::from_size_align(100, 8).unwrap();

        let p = allocator.alloc(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);

        let grown = allocator.realloc(p, layout, 300);
        assert!(!grown.is_null());

        allocator.dealloc(grown, Layout::from_size_align(300, 8).unwrap());
        assert!(allocator.alloc.lock().check_heap(line!()));
    }
}
