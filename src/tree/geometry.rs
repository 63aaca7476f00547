//! Arena geometry and implicit-tree index arithmetic
//!
//! The tree is never stored as linked nodes: node 1 is the root and node
//! `k` has children `2k` and `2k + 1`, so every structural relationship is
//! plain index arithmetic. Everything here is pure math over node indices
//! and byte addresses.

use super::state::{NODES_PER_WORD, WORD_BYTES};

/// Level of a node index; the root (index 1) is level 0.
#[inline]
pub(crate) const fn level_of(idx: usize) -> usize {
    (usize::BITS - 1 - idx.leading_zeros()) as usize
}

/// Parent of any non-root node.
#[inline]
pub(crate) const fn parent_of(idx: usize) -> usize {
    idx >> 1
}

/// Buddy of any non-root node: flips the lowest index bit.
#[inline]
pub(crate) const fn sibling_of(idx: usize) -> usize {
    idx ^ 1
}

/// Left child of a node.
#[inline]
pub(crate) const fn left_child_of(idx: usize) -> usize {
    idx << 1
}

/// Whether the node is its parent's left child.
///
/// Left children share their parent's base address, which is what makes
/// in-place growth possible.
#[inline]
pub(crate) const fn is_left_child(idx: usize) -> bool {
    idx & 1 == 0
}

/// Leaf level for a region of `size` bytes: the depth whose root block is
/// the largest power of two still fitting in the region.
///
/// Callers must ensure `size >= 2 << min_block_log2`.
#[inline]
pub(crate) const fn max_level_for(size: usize, min_block_log2: usize) -> usize {
    (usize::BITS - 1 - size.leading_zeros()) as usize - min_block_log2
}

/// Shape of an initialized arena: base address, minimum block size and the
/// depth of the leaf level. Every node address and block size derives from
/// these three values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    start: usize,
    min_block_log2: usize,
    max_level: usize,
}

impl Geometry {
    pub(crate) const fn new(start: usize, min_block_log2: usize, max_level: usize) -> Self {
        Self {
            start,
            min_block_log2,
            max_level,
        }
    }

    /// Placeholder for an allocator that has not been initialized.
    pub(crate) const fn empty() -> Self {
        Self::new(0, 0, 0)
    }

    pub(crate) const fn start(&self) -> usize {
        self.start
    }

    pub(crate) const fn max_level(&self) -> usize {
        self.max_level
    }

    /// Size in bytes of the smallest block.
    pub(crate) const fn min_block_bytes(&self) -> usize {
        1 << self.min_block_log2
    }

    /// Bytes spanned by the root block: the largest power-of-two prefix of
    /// the region.
    pub(crate) const fn covered_bytes(&self) -> usize {
        self.min_block_bytes() << self.max_level
    }

    /// Node index slots, including the unused slot 0.
    pub(crate) const fn node_slots(&self) -> usize {
        1 << (self.max_level + 1)
    }

    /// Packed state words needed for the whole tree.
    pub(crate) const fn tree_words(&self) -> usize {
        (self.node_slots() + NODES_PER_WORD - 1) / NODES_PER_WORD
    }

    /// Bytes of tree storage required.
    pub(crate) const fn tree_bytes(&self) -> usize {
        self.tree_words() * WORD_BYTES
    }

    /// Size in bytes of any block on the given level.
    pub(crate) const fn block_bytes(&self, level: usize) -> usize {
        self.min_block_bytes() << (self.max_level - level)
    }

    /// Level whose blocks are exactly `block` bytes.
    ///
    /// `block` must be a power of two between the minimum block size and
    /// `covered_bytes()`.
    pub(crate) const fn level_for(&self, block: usize) -> usize {
        self.max_level - (block.trailing_zeros() as usize - self.min_block_log2)
    }

    /// Base address of the block owned by a node.
    pub(crate) const fn node_addr(&self, idx: usize) -> usize {
        let level = level_of(idx);
        self.start + (idx - (1 << level)) * self.block_bytes(level)
    }

    /// Leaf index covering an address; the offset from `start` must be a
    /// multiple of the minimum block size.
    pub(crate) const fn leaf_for(&self, addr: usize) -> usize {
        (1 << self.max_level) + ((addr - self.start) >> self.min_block_log2)
    }
}
