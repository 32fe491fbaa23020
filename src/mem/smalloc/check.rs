//! Heap consistency sweep.
//!
//! One pass over the physical block chain and one pass over every free-list
//! bucket, cross-checked against each other. The sweep is meant for debug
//! builds (every mutating operation re-runs it behind `debug_assert!`) but is
//! always compiled, so harnesses can call it at any point.

use crate::mem::region::HeapRegion;
use crate::mem::{Alignment, HeapAddr};

use super::heap::SegFitAllocator;
use super::seglist::{BlockLink, SegregatedFreeLists, NUM_BUCKETS};
use super::tag::{MIN_BLOCK_SIZE, WORD_SIZE};

fn report(tag: u32, what: &str, at: HeapAddr) -> bool {
    log::error!("heap check failed (tag {}): {} at {}", tag, what, at);
    false
}

impl<R: HeapRegion> SegFitAllocator<R> {
    /// Verifies every structural invariant of the heap.
    ///
    /// `tag` identifies the call site in the failure report; conventionally
    /// `line!()`. The sweep stops and returns `false` at the first violation:
    /// a corrupted heap cannot be walked safely much further anyway.
    pub fn check_heap(&self, tag: u32) -> bool {
        let lo = self.region.lo();
        let hi = self.region.hi();

        if self.heap_start != lo {
            return report(tag, "heap anchor does not match the region base", lo);
        }

        let heap_free = match unsafe { self.checked_heap_walk(tag, lo, hi) } {
            Some(count) => count,
            None => return false,
        };

        unsafe { self.checked_bucket_walk(tag, lo, hi, heap_free) }
    }

    /// Walks the physical block chain from prologue to epilogue; returns the
    /// number of free blocks encountered, or `None` on a violation.
    unsafe fn checked_heap_walk(&self, tag: u32, lo: HeapAddr, hi: HeapAddr) -> Option<usize> {
        let prologue = BlockLink::from_header(lo).tag();

        if prologue.size() != 0 || !prologue.is_allocated() {
            report(tag, "malformed prologue", lo);
            return None;
        }

        let mut free_blocks = 0;
        let mut prev_allocated = true;
        let mut prev_mini = false;

        let mut cursor = BlockLink::from_header(lo + WORD_SIZE);

        loop {
            let addr = cursor.header_addr();

            if addr + (WORD_SIZE - 1) > hi {
                report(tag, "walk ran past the heap top", addr);
                return None;
            }

            if !addr.is_aligned_with(Alignment::ALIGN_8) {
                report(tag, "misaligned tag word", addr);
                return None;
            }

            let block = cursor.tag();

            if block.size() == 0 {
                if !block.is_allocated() {
                    report(tag, "free epilogue", addr);
                    return None;
                }

                if addr + (WORD_SIZE - 1) != hi {
                    report(tag, "epilogue below the heap top", addr);
                    return None;
                }

                if block.prev_allocated() != prev_allocated || block.prev_mini() != prev_mini {
                    report(tag, "stale neighbor bits in the epilogue", addr);
                    return None;
                }

                return Some(free_blocks);
            }

            if !cursor.payload_addr().is_aligned_with(Alignment::ALIGN_16) {
                report(tag, "misaligned payload", addr);
                return None;
            }

            if block.size() % MIN_BLOCK_SIZE != 0 || block.size() < MIN_BLOCK_SIZE {
                report(tag, "invalid block size", addr);
                return None;
            }

            if addr + block.size() > hi {
                report(tag, "block extends past the heap top", addr);
                return None;
            }

            if block.prev_allocated() != prev_allocated || block.prev_mini() != prev_mini {
                report(tag, "stale neighbor bits", addr);
                return None;
            }

            if !block.is_allocated() {
                if !prev_allocated {
                    report(tag, "physically adjacent free blocks", addr);
                    return None;
                }

                if block.size() > MIN_BLOCK_SIZE && cursor.footer() != block {
                    report(tag, "footer does not mirror the header", addr);
                    return None;
                }

                free_blocks += 1;
            }

            prev_allocated = block.is_allocated();
            prev_mini = block.is_mini();
            cursor = cursor.next_block();
        }
    }

    /// Walks every bucket and reconciles it against the heap walk.
    ///
    /// Bucket heads may be null; empty buckets are simply skipped. The
    /// running count doubles as a cycle guard: a bucket chain longer than the
    /// heap's free-block population can only mean a corrupted link.
    unsafe fn checked_bucket_walk(
        &self,
        tag: u32,
        lo: HeapAddr,
        hi: HeapAddr,
        heap_free: usize,
    ) -> bool {
        let mut listed_blocks = 0;

        for bucket in 0..NUM_BUCKETS {
            let mut cursor = self.buckets.heads[bucket];

            while !cursor.is_null() {
                let addr = cursor.header_addr();

                if addr < lo || addr > hi {
                    return report(tag, "free-list pointer outside the heap", addr);
                }

                let block = cursor.tag();

                if block.is_allocated() {
                    return report(tag, "allocated block on a free list", addr);
                }

                if SegregatedFreeLists::bucket_index(block.size()) != bucket {
                    return report(tag, "block filed in the wrong bucket", addr);
                }

                let next = cursor.next_free();

                if bucket != 0 && !next.is_null() && next.prev_free() != cursor {
                    return report(tag, "broken free-list back link", addr);
                }

                listed_blocks += 1;

                if listed_blocks > heap_free {
                    return report(tag, "free-list cycle", addr);
                }

                cursor = next;
            }
        }

        if listed_blocks != heap_free {
            return report(tag, "free lists out of sync with the heap walk", lo);
        }

        true
    }
}
