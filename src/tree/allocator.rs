//! The buddy tree allocator
//!
//! Block state lives in a packed two-bit array over an implicit binary
//! tree. Allocation is one level scan plus an ancestor walk; free and
//! resize are pure ancestor walks. No operation ever touches a granted
//! block's payload bytes.

use crate::{AllocError, AllocResult};

#[cfg(feature = "log")]
use log::{debug, error, info, warn};

use super::geometry::{self, Geometry};
use super::state::{NodeState, StateTree, WORD_BYTES};

#[cfg(feature = "tracking")]
use super::stats::TreeStats;

/// A granted block: base address plus the size actually reserved, which is
/// the request rounded up to a power-of-two block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub addr: usize,
    pub size: usize,
}

/// Fixed-arena buddy allocator over an implicit binary tree.
///
/// `MIN_BLOCK_LOG2` fixes the smallest grantable block and `ALIGN_LOG2`
/// the required arena start alignment; both are compile-time
/// configuration. The allocator is strictly single-threaded and callers
/// serialize access externally. Addresses are plain `usize`; granted
/// memory is never read or written, only the tree storage is.
pub struct BuddyTreeAllocator<
    const MIN_BLOCK_LOG2: usize = { crate::DEFAULT_MIN_BLOCK_LOG2 },
    const ALIGN_LOG2: usize = { crate::DEFAULT_ALIGN_LOG2 },
> {
    geo: Geometry,
    /// First byte past the grantable range. Below the covered end when
    /// self-hosted tree storage reserves the arena tail.
    limit: usize,
    tree: StateTree,
    initialized: bool,
    #[cfg(feature = "tracking")]
    stats: TreeStats,
}

impl<const MIN_BLOCK_LOG2: usize, const ALIGN_LOG2: usize>
    BuddyTreeAllocator<MIN_BLOCK_LOG2, ALIGN_LOG2>
{
    /// Size in bytes of the smallest grantable block.
    pub const MIN_BLOCK_SIZE: usize = 1 << MIN_BLOCK_LOG2;

    /// Required alignment of the arena start address.
    pub const ALIGNMENT: usize = 1 << ALIGN_LOG2;

    /// Create an inert allocator; call [`init`](Self::init) or
    /// [`init_external`](Self::init_external) before use.
    pub const fn new() -> Self {
        Self {
            geo: Geometry::empty(),
            limit: 0,
            tree: StateTree::new(),
            initialized: false,
            #[cfg(feature = "tracking")]
            stats: TreeStats::new(),
        }
    }

    /// Bytes of tree storage needed to manage a region of `arena_size`
    /// bytes, whether self-hosted or caller-provided.
    ///
    /// Callable before any allocator exists, so external tree buffers can
    /// be sized up front.
    pub const fn min_tree_size(arena_size: usize) -> AllocResult<usize> {
        if arena_size < 2 * Self::MIN_BLOCK_SIZE {
            return Err(AllocError::InvalidParam);
        }
        let max_level = geometry::max_level_for(arena_size, MIN_BLOCK_LOG2);
        if max_level > crate::MAX_LEVEL {
            return Err(AllocError::InvalidParam);
        }
        Ok(Geometry::new(0, MIN_BLOCK_LOG2, max_level).tree_bytes())
    }

    /// Initialize over `[start, end)` with the tree stored in the region's
    /// own tail.
    ///
    /// The caller must own the region and keep it valid for the
    /// allocator's lifetime; the carved tail words are written by the
    /// allocator and must not be used for anything else. Whole minimum
    /// blocks below the carve point remain grantable. Re-initializing
    /// discards all existing allocations.
    pub fn init(&mut self, start: usize, end: usize) -> AllocResult {
        let geo = self.validate_region(start, end)?;
        let tree_bytes = geo.tree_bytes();
        if tree_bytes > end - start {
            error!(
                "buddy tree: region [{:#x}, {:#x}) cannot hold its own {} tree bytes",
                start, end, tree_bytes
            );
            return Err(AllocError::InvalidParam);
        }
        let tree_addr = crate::align_down(end - tree_bytes, WORD_BYTES);
        if tree_addr < start {
            error!(
                "buddy tree: region [{:#x}, {:#x}) cannot hold its own {} tree bytes",
                start, end, tree_bytes
            );
            return Err(AllocError::InvalidParam);
        }
        let covered_end = start + geo.covered_bytes();
        let usable_bytes = crate::align_down(tree_addr - start, Self::MIN_BLOCK_SIZE);
        let limit = covered_end.min(start + usable_bytes);
        if limit < start + Self::MIN_BLOCK_SIZE {
            error!(
                "buddy tree: region [{:#x}, {:#x}) leaves no usable block after the tree carve",
                start, end
            );
            return Err(AllocError::InvalidParam);
        }

        self.commit_init(geo, limit, tree_addr);

        // Blocks between the usable limit and the covered end overlap the
        // tree words or their padding; reserve them so they can never be
        // granted or merged over.
        let mut addr = limit;
        while addr < covered_end {
            let leaf = geo.leaf_for(addr);
            self.mark_used(leaf);
            addr += Self::MIN_BLOCK_SIZE;
        }

        info!(
            "buddy tree: arena [{:#x}, {:#x}), {} levels, tree at {:#x} ({} bytes), usable up to {:#x}",
            start,
            end,
            geo.max_level(),
            tree_addr,
            tree_bytes,
            limit
        );
        Ok(())
    }

    /// Initialize over `[start, end)` with tree storage in a
    /// caller-provided buffer at `tree_addr`.
    ///
    /// The buffer must be word-aligned, hold at least
    /// [`min_tree_size`](Self::min_tree_size)`(end - start)` bytes, stay
    /// valid for the allocator's lifetime and lie outside memory the
    /// caller intends to use. The whole covered prefix of the region is
    /// grantable.
    pub fn init_external(
        &mut self,
        start: usize,
        end: usize,
        tree_addr: usize,
        tree_size: usize,
    ) -> AllocResult {
        let geo = self.validate_region(start, end)?;
        if !crate::is_aligned(tree_addr, WORD_BYTES) || tree_size < geo.tree_bytes() {
            error!(
                "buddy tree: tree buffer at {:#x} (+{}) unusable, need {} word-aligned bytes",
                tree_addr,
                tree_size,
                geo.tree_bytes()
            );
            return Err(AllocError::InvalidParam);
        }
        self.commit_init(geo, start + geo.covered_bytes(), tree_addr);
        info!(
            "buddy tree: arena [{:#x}, {:#x}), {} levels, external tree at {:#x} ({} bytes)",
            start,
            end,
            geo.max_level(),
            tree_addr,
            geo.tree_bytes()
        );
        Ok(())
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// The request is rounded up to the next power-of-two block, never
    /// below the minimum block size; the returned [`Block`] carries the
    /// base address and the rounded size. Candidates are scanned left to
    /// right on the target level, so placement is deterministic.
    pub fn alloc(&mut self, size: usize) -> AllocResult<Block> {
        if !self.initialized {
            return Err(AllocError::NoMemory);
        }
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }
        if size > self.geo.covered_bytes() {
            debug!("buddy tree: allocation of {} bytes exceeds the arena", size);
            return Err(AllocError::NoMemory);
        }
        let granted = size.next_power_of_two().max(Self::MIN_BLOCK_SIZE);
        let level = self.geo.level_for(granted);
        let idx = match self.find_free_node(level) {
            Some(idx) => idx,
            None => {
                debug!("buddy tree: no free {}-byte block", granted);
                return Err(AllocError::NoMemory);
            }
        };
        self.mark_used(idx);
        #[cfg(feature = "tracking")]
        {
            self.stats.alloc_count += 1;
            self.stats.used_bytes += granted;
            self.stats.used_blocks_by_level[level] += 1;
        }
        Ok(Block {
            addr: self.geo.node_addr(idx),
            size: granted,
        })
    }

    /// Release the block whose base address is `addr`.
    ///
    /// `addr` must be exactly the base returned by [`alloc`](Self::alloc)
    /// (or established by [`adjust`](Self::adjust)). Interior addresses
    /// and foreign pointers are rejected without touching any state.
    pub fn free(&mut self, addr: usize) -> AllocResult {
        let idx = self.resolve(addr)?;
        self.tree.set(idx, NodeState::Free);
        self.coalesce(idx);
        #[cfg(feature = "tracking")]
        {
            let level = geometry::level_of(idx);
            self.stats.free_count += 1;
            self.stats.used_bytes -= self.geo.block_bytes(level);
            self.stats.used_blocks_by_level[level] -= 1;
        }
        Ok(())
    }

    /// Resize the live block at `addr` in place, keeping its base address.
    ///
    /// Returns the new granted size. Shrinking always succeeds and
    /// releases the tail back to the tree. Growing succeeds only when the
    /// block can absorb its buddies without moving: it must sit on the
    /// left spine of the target ancestor and every absorbed sibling
    /// subtree must be entirely free. A blocked grow returns
    /// [`AllocError::NoMemory`] and changes nothing.
    pub fn adjust(&mut self, addr: usize, new_size: usize) -> AllocResult<usize> {
        if new_size == 0 {
            return Err(AllocError::InvalidParam);
        }
        let idx = self.resolve(addr)?;
        if new_size > self.geo.covered_bytes() {
            debug!("buddy tree: cannot grow {:#x} to {} bytes", addr, new_size);
            return Err(AllocError::NoMemory);
        }
        let granted = new_size.next_power_of_two().max(Self::MIN_BLOCK_SIZE);
        let old_level = geometry::level_of(idx);
        let new_level = self.geo.level_for(granted);

        if new_level < old_level {
            self.grow(idx, old_level, new_level)?;
        } else if new_level > old_level {
            self.shrink(idx, old_level, new_level);
        }
        #[cfg(feature = "tracking")]
        {
            if new_level != old_level {
                let old_bytes = self.geo.block_bytes(old_level);
                self.stats.used_blocks_by_level[old_level] -= 1;
                self.stats.used_blocks_by_level[new_level] += 1;
                if granted > old_bytes {
                    self.stats.used_bytes += granted - old_bytes;
                } else {
                    self.stats.used_bytes -= old_bytes - granted;
                }
            }
        }
        Ok(granted)
    }

    /// Snapshot of the allocator's usage counters.
    #[cfg(feature = "tracking")]
    pub fn stats(&self) -> TreeStats {
        self.stats
    }

    /// Log a one-line usage summary.
    #[cfg(feature = "tracking")]
    pub fn log_stats(&self) {
        info!(
            "buddy tree: {} bytes covered, {} reserved, {} used, {} available ({} allocs, {} frees)",
            self.stats.total_bytes,
            self.stats.reserved_bytes,
            self.stats.used_bytes,
            self.stats.available_bytes(),
            self.stats.alloc_count,
            self.stats.free_count
        );
    }

    fn validate_region(&self, start: usize, end: usize) -> AllocResult<Geometry> {
        if start >= end || !crate::is_aligned(start, Self::ALIGNMENT) {
            error!("buddy tree: invalid region [{:#x}, {:#x})", start, end);
            return Err(AllocError::InvalidParam);
        }
        let size = end - start;
        if size < 2 * Self::MIN_BLOCK_SIZE {
            error!(
                "buddy tree: region [{:#x}, {:#x}) smaller than two minimum blocks",
                start, end
            );
            return Err(AllocError::InvalidParam);
        }
        let max_level = geometry::max_level_for(size, MIN_BLOCK_LOG2);
        if max_level > crate::MAX_LEVEL {
            error!(
                "buddy tree: region depth {} exceeds maximum level {}",
                max_level,
                crate::MAX_LEVEL
            );
            return Err(AllocError::InvalidParam);
        }
        Ok(Geometry::new(start, MIN_BLOCK_LOG2, max_level))
    }

    fn commit_init(&mut self, geo: Geometry, limit: usize, tree_addr: usize) {
        self.geo = geo;
        self.limit = limit;
        self.tree.attach(tree_addr, geo.tree_words());
        self.initialized = true;
        #[cfg(feature = "tracking")]
        {
            self.stats = TreeStats::new();
            self.stats.total_bytes = geo.covered_bytes();
            self.stats.reserved_bytes = geo.covered_bytes() - (limit - geo.start());
        }
    }

    /// Leftmost node on `level` that is free and under no used ancestor.
    ///
    /// A stored free state can sit below a used ancestor, because marking
    /// a block used never rewrites its subtree. Every candidate's ancestor
    /// chain is therefore checked, and when a used ancestor blocks a
    /// candidate the scan jumps past that ancestor's entire subtree
    /// instead of probing it node by node.
    fn find_free_node(&self, level: usize) -> Option<usize> {
        let mut idx = 1usize << level;
        let level_end = 1usize << (level + 1);
        while idx < level_end {
            if self.tree.get(idx) != NodeState::Free {
                idx += 1;
                continue;
            }
            match self.blocking_ancestor(idx) {
                None => return Some(idx),
                Some(blocked) => {
                    idx = (blocked + 1) << (level - geometry::level_of(blocked));
                }
            }
        }
        None
    }

    /// First used ancestor of `idx`, if any.
    ///
    /// Stops early at a partial ancestor: partial nodes only ever sit
    /// below other partial nodes, never below a used one.
    fn blocking_ancestor(&self, idx: usize) -> Option<usize> {
        let mut node = geometry::parent_of(idx);
        while node >= 1 {
            match self.tree.get(node) {
                NodeState::Used => return Some(node),
                NodeState::Partial => return None,
                NodeState::Free => node = geometry::parent_of(node),
            }
        }
        None
    }

    /// Mark `idx` used and its free ancestors partial.
    fn mark_used(&mut self, idx: usize) {
        self.tree.set(idx, NodeState::Used);
        let mut node = geometry::parent_of(idx);
        while node >= 1 && self.tree.get(node) == NodeState::Free {
            self.tree.set(node, NodeState::Partial);
            node = geometry::parent_of(node);
        }
    }

    /// Merge freed buddies upward while both siblings are free.
    fn coalesce(&mut self, mut idx: usize) {
        while idx > 1 && self.tree.get(geometry::sibling_of(idx)) == NodeState::Free {
            idx = geometry::parent_of(idx);
            self.tree.set(idx, NodeState::Free);
        }
    }

    /// Find the live block whose base address is exactly `addr`.
    ///
    /// Projects the address onto its leaf and walks the ancestor chain up
    /// to the used node; that node's own base must match `addr`, so
    /// interior addresses of a larger block do not resolve.
    fn resolve(&self, addr: usize) -> AllocResult<usize> {
        if !self.initialized {
            return Err(AllocError::NotAllocated);
        }
        let start = self.geo.start();
        if addr < start
            || addr >= self.limit
            || !crate::is_aligned(addr - start, Self::MIN_BLOCK_SIZE)
        {
            warn!("buddy tree: address {:#x} is not a block in this arena", addr);
            return Err(AllocError::NotAllocated);
        }
        let mut idx = self.geo.leaf_for(addr);
        while idx >= 1 && self.tree.get(idx) != NodeState::Used {
            idx = geometry::parent_of(idx);
        }
        if idx == 0 || self.geo.node_addr(idx) != addr {
            warn!("buddy tree: address {:#x} is not a live block base", addr);
            return Err(AllocError::NotAllocated);
        }
        Ok(idx)
    }

    /// Replace the used node with a used ancestor at `new_level`.
    ///
    /// The whole path is validated before anything is written: the node
    /// must be a left child at every step (the base address may not move)
    /// and every absorbed sibling must be free. Eager coalescing keeps
    /// sibling states authoritative, so one read per level suffices.
    fn grow(&mut self, idx: usize, old_level: usize, new_level: usize) -> AllocResult {
        let mut target = idx;
        for _ in new_level..old_level {
            if !geometry::is_left_child(target)
                || self.tree.get(geometry::sibling_of(target)) != NodeState::Free
            {
                debug!(
                    "buddy tree: cannot grow {:#x} in place",
                    self.geo.node_addr(idx)
                );
                return Err(AllocError::NoMemory);
            }
            target = geometry::parent_of(target);
        }
        let mut node = idx;
        while node != target {
            self.tree.set(node, NodeState::Free);
            node = geometry::parent_of(node);
        }
        self.tree.set(target, NodeState::Used);
        Ok(())
    }

    /// Replace the used node with a used left-spine descendant at
    /// `new_level`, releasing the tail of the block.
    ///
    /// The old node and the spine between become partial. Everything
    /// right of the spine was interior to the old block and is already
    /// stored free, so the released tail needs no extra writes.
    fn shrink(&mut self, idx: usize, old_level: usize, new_level: usize) {
        let mut node = idx;
        for _ in old_level..new_level {
            self.tree.set(node, NodeState::Partial);
            node = geometry::left_child_of(node);
        }
        self.tree.set(node, NodeState::Used);
    }
}

impl<const MIN_BLOCK_LOG2: usize, const ALIGN_LOG2: usize> Default
    for BuddyTreeAllocator<MIN_BLOCK_LOG2, ALIGN_LOG2>
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // External-tree tests run against a synthetic arena range: the
    // allocator only ever dereferences its tree storage.
    const VIRT_START: usize = 0x1000;

    #[test]
    fn test_min_tree_size() {
        type A = BuddyTreeAllocator<2, 2>;
        assert_eq!(A::min_tree_size(7), Err(AllocError::InvalidParam));
        assert_eq!(A::min_tree_size(8), Ok(4));
        assert_eq!(A::min_tree_size(64), Ok(8));
        assert_eq!(A::min_tree_size(1 << 40), Err(AllocError::InvalidParam));
    }

    #[test]
    fn test_external_init_and_alloc_roundtrip() {
        let mut words = [0u32; 2];
        let mut allocator = BuddyTreeAllocator::<2, 2>::new();
        allocator
            .init_external(VIRT_START, VIRT_START + 64, words.as_mut_ptr() as usize, 8)
            .unwrap();

        let a = allocator.alloc(32).unwrap();
        assert_eq!(a.addr, VIRT_START);
        assert_eq!(a.size, 32);
        let b = allocator.alloc(16).unwrap();
        assert_eq!(b.addr, VIRT_START + 32);
        let c = allocator.alloc(8).unwrap();
        assert_eq!(c.addr, VIRT_START + 48);
        let d = allocator.alloc(8).unwrap();
        assert_eq!(d.addr, VIRT_START + 56);
        assert_eq!(allocator.alloc(4), Err(AllocError::NoMemory));

        allocator.free(b.addr).unwrap();
        allocator.free(a.addr).unwrap();
        allocator.free(d.addr).unwrap();
        allocator.free(c.addr).unwrap();

        let whole = allocator.alloc(64).unwrap();
        assert_eq!(whole.addr, VIRT_START);
    }

    #[test]
    fn test_scan_skips_blocked_subtree() {
        let mut words = [0u32; 2];
        let mut allocator = BuddyTreeAllocator::<2, 2>::new();
        allocator
            .init_external(VIRT_START, VIRT_START + 64, words.as_mut_ptr() as usize, 8)
            .unwrap();

        // The 32-byte block marks only its own node used; its leaf
        // descendants keep a stored free state, so the leaf scan must see
        // the used ancestor and land past the whole subtree.
        let big = allocator.alloc(32).unwrap();
        assert_eq!(big.addr, VIRT_START);
        let small = allocator.alloc(4).unwrap();
        assert_eq!(small.addr, VIRT_START + 32);
    }

    #[test]
    fn test_self_hosted_reserves_tree_tail() {
        #[repr(align(64))]
        struct TestArena([u8; 64]);

        let mut arena = TestArena([0; 64]);
        let start = arena.0.as_mut_ptr() as usize;
        let mut allocator = BuddyTreeAllocator::<2, 2>::new();
        allocator.init(start, start + 64).unwrap();

        // the 8 tree bytes reserve the last two 4-byte leaves
        assert_eq!(allocator.alloc(64), Err(AllocError::NoMemory));
        assert_eq!(allocator.alloc(32).unwrap().addr, start);
        assert_eq!(allocator.alloc(16).unwrap().addr, start + 32);
        assert_eq!(allocator.alloc(8).unwrap().addr, start + 48);
        assert_eq!(allocator.alloc(4), Err(AllocError::NoMemory));

        // the reserved tail is not a live block
        assert_eq!(allocator.free(start + 56), Err(AllocError::NotAllocated));
    }

    #[test]
    fn test_self_hosted_minimal_region() {
        #[repr(align(16))]
        struct TestArena([u8; 16]);

        let mut arena = TestArena([0; 16]);
        let start = arena.0.as_mut_ptr() as usize;

        let mut allocator = BuddyTreeAllocator::<2, 2>::new();
        // one minimum block cannot host both a grant and the tree
        assert_eq!(
            allocator.init(start, start + 4),
            Err(AllocError::InvalidParam)
        );

        // two minimum blocks leave one grantable after the carve
        allocator.init(start, start + 8).unwrap();
        let block = allocator.alloc(4).unwrap();
        assert_eq!(block.addr, start);
        assert_eq!(allocator.alloc(4), Err(AllocError::NoMemory));
        allocator.free(block.addr).unwrap();
    }

    #[test]
    fn test_uninitialized_allocator_rejects_ops() {
        let mut allocator = BuddyTreeAllocator::<2, 2>::new();
        assert_eq!(allocator.alloc(4), Err(AllocError::NoMemory));
        assert_eq!(allocator.free(VIRT_START), Err(AllocError::NotAllocated));
        assert_eq!(
            allocator.adjust(VIRT_START, 4),
            Err(AllocError::NotAllocated)
        );
    }

    #[test]
    fn test_misaligned_or_empty_region_rejected() {
        let mut words = [0u32; 2];
        let tree_addr = words.as_mut_ptr() as usize;
        let mut allocator = BuddyTreeAllocator::<2, 4>::new();

        assert_eq!(
            allocator.init_external(VIRT_START + 1, VIRT_START + 65, tree_addr, 8),
            Err(AllocError::InvalidParam)
        );
        assert_eq!(
            allocator.init_external(VIRT_START, VIRT_START, tree_addr, 8),
            Err(AllocError::InvalidParam)
        );
        // undersized tree buffer
        assert_eq!(
            allocator.init_external(VIRT_START, VIRT_START + 64, tree_addr, 7),
            Err(AllocError::InvalidParam)
        );
        // word-misaligned tree buffer
        assert_eq!(
            allocator.init_external(VIRT_START, VIRT_START + 64, tree_addr + 1, 8),
            Err(AllocError::InvalidParam)
        );
    }

    #[test]
    fn test_region_deeper_than_max_level_rejected() {
        let mut words = [0u32; 2];
        let tree_addr = words.as_mut_ptr() as usize;
        let mut allocator = BuddyTreeAllocator::<2, 4>::new();

        // both init forms reject the depth before touching any storage,
        // so a synthetic range is fine even for the self-hosted form
        assert_eq!(
            allocator.init(VIRT_START, VIRT_START + (1 << 40)),
            Err(AllocError::InvalidParam)
        );
        assert_eq!(
            allocator.init_external(VIRT_START, VIRT_START + (1 << 40), tree_addr, 8),
            Err(AllocError::InvalidParam)
        );
        // the allocator stays inert after the rejections
        assert_eq!(allocator.alloc(4), Err(AllocError::NoMemory));
    }
}
