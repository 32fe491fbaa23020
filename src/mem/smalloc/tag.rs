//! Boundary tag codec.
//!
//! Every heap block starts with a single 64-bit tag word packing the block
//! size together with three status bits. Free blocks larger than a mini block
//! mirror the tag in their last word (the footer) so the previous physical
//! block can be located without any out-of-band index.

use bytemuck::{Pod, Zeroable};

/// Size of a tag word, and of every on-heap bookkeeping word.
pub(crate) const WORD_SIZE: u64 = 8;

/// Smallest representable block: one tag word plus one payload/pointer word.
pub(crate) const MIN_BLOCK_SIZE: u64 = 16;

const ALLOC_BIT: u64 = 0b001;
const PREV_ALLOC_BIT: u64 = 0b010;
const PREV_MINI_BIT: u64 = 0b100;
const SIZE_MASK: u64 = !(MIN_BLOCK_SIZE - 1);

/// Header (and footer) word of a heap block.
///
/// | Bits  | Field                                                        |
/// |-------|--------------------------------------------------------------|
/// | 63..4 | block size in bytes, tag words included; multiple of 16      |
/// | 2     | the physically preceding block is a mini block               |
/// | 1     | the physically preceding block is allocated                  |
/// | 0     | this block is allocated                                      |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub(crate) struct BlockTag(u64);

impl BlockTag {
    /// Packs a size and the three status bits into a tag word.
    ///
    /// `size` must already be 16-aligned; stray low bits are masked off.
    pub(crate) fn pack(size: u64, allocated: bool, prev_allocated: bool, prev_mini: bool) -> Self {
        let mut word = size & SIZE_MASK;

        if allocated {
            word |= ALLOC_BIT;
        }
        if prev_allocated {
            word |= PREV_ALLOC_BIT;
        }
        if prev_mini {
            word |= PREV_MINI_BIT;
        }

        Self(word)
    }

    pub(crate) fn size(&self) -> u64 {
        self.0 & SIZE_MASK
    }

    pub(crate) fn is_allocated(&self) -> bool {
        self.0 & ALLOC_BIT != 0
    }

    pub(crate) fn prev_allocated(&self) -> bool {
        self.0 & PREV_ALLOC_BIT != 0
    }

    pub(crate) fn prev_mini(&self) -> bool {
        self.0 & PREV_MINI_BIT != 0
    }

    pub(crate) fn is_mini(&self) -> bool {
        self.size() == MIN_BLOCK_SIZE
    }

    /// Returns this tag with its neighbor-description bits replaced.
    ///
    /// Used to propagate a block rewrite to the tag of its physical successor
    /// without touching the successor's own size or allocation state.
    pub(crate) fn with_neighbor(&self, prev_allocated: bool, prev_mini: bool) -> Self {
        Self::pack(self.size(), self.is_allocated(), prev_allocated, prev_mini)
    }
}
