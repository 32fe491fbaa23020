//! Segregated-fit placement engine.
//!
//! The engine owns a [`HeapRegion`] and manages every block inside it: bounded
//! best-of-k search through the size-class buckets, splitting of oversized
//! fits, eager coalescing of freed blocks and "sbrk"-style growth when no free
//! block can satisfy a request.

use core::ptr;

use crate::mem::region::HeapRegion;
use crate::mem::{Alignment, HeapAddr, MemoryError};

use super::seglist::{BlockLink, SegregatedFreeLists};
use super::tag::{BlockTag, MIN_BLOCK_SIZE, WORD_SIZE};

/// Segregated-fit allocator over a growable heap region.
///
/// The region is anchored by two 8-byte sentinels: a prologue word at its low
/// end and an epilogue word at its high-water mark, both tagged as allocated
/// zero-sized blocks so coalescing never runs off the heap. Every payload
/// handed out lies strictly between them, 16-byte aligned.
pub struct SegFitAllocator<R: HeapRegion> {
    pub(super) region: R,
    pub(super) heap_start: HeapAddr,
    pub(super) buckets: SegregatedFreeLists,
}

/// Point-in-time usage counters for a [`SegFitAllocator`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes obtained from the heap provider, sentinels included.
    pub heap_bytes: usize,

    /// Bytes held by free blocks, their bookkeeping words included.
    pub free_bytes: usize,

    /// Number of free blocks.
    pub free_blocks: usize,
}

/// Free physical neighbors of a block about to be coalesced.
///
/// Produced by a read-only scan, consumed by the merge that unlinks the
/// neighbors and rewrites the surviving tag.
#[derive(Debug)]
struct MergeScan {
    surviving: BlockLink,
    left: BlockLink,
    right: BlockLink,
    merged_size: u64,
}

impl<R: HeapRegion> SegFitAllocator<R> {
    /// Bytes the heap grows by when a request cannot be satisfied, unless the
    /// request itself is larger.
    const GROW_CHUNK: u64 = 4096;

    /// Fit candidates examined per bucket before the best one is taken.
    const PROBE_LIMIT: usize = 5;

    /// Initializes an allocator over the given region.
    ///
    /// Writes the prologue and epilogue sentinels, then grows the heap by one
    /// chunk so the first allocation does not pay for an extension.
    pub fn init(mut region: R) -> Result<Self, MemoryError> {
        let base = region.extend(2 * WORD_SIZE as usize)?;

        if !base.is_aligned_with(Alignment::ALIGN_16) {
            return Err(MemoryError::InvalidAlignment);
        }

        let mut heap = Self {
            region,
            heap_start: base,
            buckets: SegregatedFreeLists::new(),
        };

        unsafe {
            let prologue = BlockLink::from_header(base);
            prologue.set_tag(BlockTag::pack(0, true, false, false));

            let epilogue = BlockLink::from_header(base + WORD_SIZE);
            epilogue.set_tag(BlockTag::pack(0, true, true, false));

            let first = heap.grow_heap(Self::GROW_CHUNK)?;
            heap.buckets.insert(first);
        }

        log::info!("segregated-fit heap initialized at {}", base);
        debug_assert!(heap.check_heap(line!()), "heap consistency sweep failed");

        Ok(heap)
    }

    /// Allocates `size` bytes and returns the 16-byte aligned payload
    /// address, or [`HeapAddr::NULL_PTR`] when `size` is zero or the region
    /// cannot be grown any further.
    pub fn allocate(&mut self, size: usize) -> HeapAddr {
        if size == 0 {
            return HeapAddr::NULL_PTR;
        }

        let asize = match Self::adjusted_size(size) {
            Some(asize) => asize,
            None => return HeapAddr::NULL_PTR,
        };

        let payload = unsafe {
            let mut block = self.find_fit(asize);

            if block.is_null() {
                block = match self.grow_heap(asize.max(Self::GROW_CHUNK)) {
                    Ok(grown) => grown,
                    Err(_) => return HeapAddr::NULL_PTR,
                };

                self.buckets.insert(block);
            }

            self.place(block, asize)
        };

        debug_assert!(self.check_heap(line!()), "heap consistency sweep failed");

        payload
    }

    /// Returns the block owning `payload` to the free state, eagerly merging
    /// it with free physical neighbors.
    ///
    /// No-op on the null address.
    ///
    /// # Safety
    ///
    /// `payload` must be null or an address previously returned by this
    /// allocator and not released since.
    pub unsafe fn release(&mut self, payload: HeapAddr) {
        if payload.is_null() {
            return;
        }

        let block = BlockLink::from_payload(payload);
        debug_assert!(block.tag().is_allocated());

        block.write(block.tag().size(), false);

        let merged = self.coalesce_block(block);
        self.buckets.insert(merged);

        debug_assert!(self.check_heap(line!()), "heap consistency sweep failed");
    }

    /// Resizes the allocation owning `payload` by allocating anew, copying
    /// the overlapping payload prefix and releasing the old block.
    ///
    /// A null `payload` behaves like [`SegFitAllocator::allocate`]; a zero
    /// `size` behaves like [`SegFitAllocator::release`] and returns the null
    /// address. When the new allocation fails the original block is left
    /// untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`SegFitAllocator::release`].
    pub unsafe fn reallocate(&mut self, payload: HeapAddr, size: usize) -> HeapAddr {
        if payload.is_null() {
            return self.allocate(size);
        }

        if size == 0 {
            self.release(payload);
            return HeapAddr::NULL_PTR;
        }

        let old_payload_bytes = BlockLink::from_payload(payload).tag().size() - WORD_SIZE;

        let new_payload = self.allocate(size);
        if new_payload.is_null() {
            return HeapAddr::NULL_PTR;
        }

        let copied = old_payload_bytes.min(u64::try_from(size).expect("infallible conversion"));
        ptr::copy_nonoverlapping(
            payload.as_ptr::<u8>(),
            new_payload.as_mut_ptr::<u8>(),
            usize::try_from(copied).expect("infallible conversion"),
        );

        self.release(payload);

        new_payload
    }

    /// Allocates a zero-filled array of `count` elements of `elem_size`
    /// bytes.
    ///
    /// Returns the null address when `count * elem_size` overflows, without
    /// touching the heap.
    pub fn callocate(&mut self, count: usize, elem_size: usize) -> HeapAddr {
        let total = match count.checked_mul(elem_size) {
            Some(total) => total,
            None => return HeapAddr::NULL_PTR,
        };

        let payload = self.allocate(total);

        if !payload.is_null() {
            unsafe { ptr::write_bytes(payload.as_mut_ptr::<u8>(), 0, total) };
        }

        payload
    }

    /// Current usage counters, gathered by one pass over the heap.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_bytes: usize::try_from(self.region.hi() - self.region.lo() + 1)
                .expect("infallible conversion"),
            ..HeapStats::default()
        };

        unsafe {
            let mut cursor = BlockLink::from_header(self.heap_start + WORD_SIZE);

            loop {
                let tag = cursor.tag();

                if tag.size() == 0 {
                    break;
                }

                if !tag.is_allocated() {
                    stats.free_bytes += usize::try_from(tag.size()).expect("infallible conversion");
                    stats.free_blocks += 1;
                }

                cursor = cursor.next_block();
            }
        }

        stats
    }

    /// Request size to block size: one tag word of overhead, rounded up to
    /// the payload alignment, never below the mini block.
    fn adjusted_size(size: usize) -> Option<u64> {
        let size = u64::try_from(size).ok()?;
        let padded = size.checked_add(WORD_SIZE)?;
        let rounded = padded.checked_add(MIN_BLOCK_SIZE - 1)? & !(MIN_BLOCK_SIZE - 1);

        Some(rounded.max(MIN_BLOCK_SIZE))
    }

    /// Bounded best-of-k search.
    ///
    /// Walks the first bucket that can hold `asize`, examining up to
    /// [`Self::PROBE_LIMIT`] blocks large enough and keeping the tightest of
    /// them. A bucket that produced any candidate ends the search; an empty
    /// sweep moves on to the next larger bucket.
    unsafe fn find_fit(&self, asize: u64) -> BlockLink {
        let first_bucket = SegregatedFreeLists::bucket_index(asize);

        for bucket in first_bucket..self.buckets.heads.len() {
            let mut best = BlockLink::NULL_LINK;
            let mut best_size = u64::MAX;
            let mut probes = 0;

            let mut cursor = self.buckets.heads[bucket];

            while !cursor.is_null() && probes < Self::PROBE_LIMIT {
                let size = cursor.tag().size();

                if size >= asize {
                    probes += 1;

                    if size < best_size {
                        best = cursor;
                        best_size = size;
                    }
                }

                cursor = cursor.next_free();
            }

            if !best.is_null() {
                return best;
            }
        }

        BlockLink::NULL_LINK
    }

    /// Marks a fitting free block as allocated, splitting off the tail as a
    /// new free block when at least a mini block remains.
    unsafe fn place(&mut self, block: BlockLink, asize: u64) -> HeapAddr {
        self.buckets.remove(block);

        let full_size = block.tag().size();

        if full_size - asize >= MIN_BLOCK_SIZE {
            block.write(asize, true);

            let tail = BlockLink::from_header(block.header_addr() + asize);
            tail.write_fresh(full_size - asize, false, true, asize == MIN_BLOCK_SIZE);

            self.buckets.insert(tail);
            self.sync_successor(tail);
        } else {
            block.write(full_size, true);
            self.sync_successor(block);
        }

        block.payload_addr()
    }

    /// Merges a just-freed block with its free physical neighbors and
    /// returns the surviving block, not yet on any free list.
    unsafe fn coalesce_block(&mut self, block: BlockLink) -> BlockLink {
        let scan = self.scan_free_neighbors(block);
        self.merge_free_neighbors(scan)
    }

    unsafe fn scan_free_neighbors(&self, block: BlockLink) -> MergeScan {
        let tag = block.tag();
        let mut scan = MergeScan {
            surviving: block,
            left: BlockLink::NULL_LINK,
            right: BlockLink::NULL_LINK,
            merged_size: tag.size(),
        };

        let right = block.next_block();

        if !right.tag().is_allocated() {
            scan.right = right;
            scan.merged_size += right.tag().size();
        }

        if !tag.prev_allocated() {
            let left = block.prev_block();
            scan.left = left;
            scan.merged_size += left.tag().size();
            scan.surviving = left;
        }

        scan
    }

    unsafe fn merge_free_neighbors(&mut self, scan: MergeScan) -> BlockLink {
        if !scan.left.is_null() {
            self.buckets.remove(scan.left);
        }

        if !scan.right.is_null() {
            self.buckets.remove(scan.right);
        }

        scan.surviving.write(scan.merged_size, false);
        self.sync_successor(scan.surviving);

        scan.surviving
    }

    /// Re-synchronizes the neighbor-description bits of the block physically
    /// following `block`.
    ///
    /// Must be called after any rewrite that changes a block's size or
    /// allocation state. The epilogue participates like any other successor.
    /// Only these two bits carry information across the boundary; when the
    /// successor is a free non-mini block its footer is re-mirrored so the
    /// header/footer redundancy stays exact.
    unsafe fn sync_successor(&self, block: BlockLink) {
        let tag = block.tag();
        let next = block.next_block();
        let old = next.tag();

        next.set_tag(old.with_neighbor(tag.is_allocated(), tag.is_mini()));

        if !old.is_allocated() && old.size() > MIN_BLOCK_SIZE {
            next.mirror_footer();
        }
    }

    /// Grows the heap by at least `bytes` and returns the resulting free
    /// block, already merged with a free predecessor when there is one. The
    /// caller is responsible for inserting it into the free lists.
    ///
    /// The new block's tag overlays the old epilogue word, inheriting its
    /// neighbor-description bits; a fresh epilogue is written at the new
    /// high-water mark.
    unsafe fn grow_heap(&mut self, bytes: u64) -> Result<BlockLink, MemoryError> {
        let size = Alignment::ALIGN_16.align_up(bytes);
        let area = self
            .region
            .extend(usize::try_from(size).expect("infallible conversion"))?;

        log::debug!("growing heap by {:#x} bytes, new area {}", size, area);

        let block = BlockLink::from_header(area - WORD_SIZE);
        block.write(size, false);

        let epilogue = BlockLink::from_header(block.header_addr() + size);
        epilogue.set_tag(BlockTag::pack(0, true, false, false));

        Ok(self.coalesce_block(block))
    }
}
