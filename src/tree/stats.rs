//! Statistics for the buddy tree allocator
//!
//! Counters are updated incrementally on every successful operation, so a
//! snapshot is a plain copy.

/// Usage statistics for one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Bytes of the covered power-of-two prefix.
    pub total_bytes: usize,
    /// Bytes reserved at init for self-hosted tree storage and its padding.
    pub reserved_bytes: usize,
    /// Bytes currently granted to callers.
    pub used_bytes: usize,
    /// Successful allocations over the allocator's lifetime.
    pub alloc_count: usize,
    /// Successful frees over the allocator's lifetime.
    pub free_count: usize,
    /// Live blocks per tree level; level 0 is the whole-arena block.
    pub used_blocks_by_level: [usize; crate::MAX_LEVEL + 1],
}

impl Default for TreeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeStats {
    pub const fn new() -> Self {
        Self {
            total_bytes: 0,
            reserved_bytes: 0,
            used_bytes: 0,
            alloc_count: 0,
            free_count: 0,
            used_blocks_by_level: [0; crate::MAX_LEVEL + 1],
        }
    }

    /// Bytes still grantable: covered minus reserved minus used.
    pub const fn available_bytes(&self) -> usize {
        self.total_bytes - self.reserved_bytes - self.used_bytes
    }

    /// Total number of live blocks across all levels.
    pub fn live_blocks(&self) -> usize {
        self.used_blocks_by_level.iter().sum()
    }
}
