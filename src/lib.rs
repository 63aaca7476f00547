//! Buddy Tree Allocator
//!
//! This crate implements a fixed-arena buddy memory allocator for
//! single-threaded environments, featuring:
//! - Implicit binary tree addressed purely by index arithmetic
//! - Packed 2-bit node states, 16 nodes per `u32` word
//! - Tree storage carved from the arena tail, or a caller-provided buffer
//! - O(log n) allocate / free and in-place resize of live blocks
//!
//! The allocator never reads or writes granted memory; it only touches its
//! own tree storage. Callers serialize access externally.

#![no_std]

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default log2 of the minimum block size (16-byte blocks).
pub const DEFAULT_MIN_BLOCK_LOG2: usize = 4;

/// Default log2 of the required arena start alignment (16 bytes).
pub const DEFAULT_ALIGN_LOG2: usize = 4;

/// Deepest supported leaf level. Bounds the tree depth accepted at init
/// and sizes the per-level statistics array.
pub const MAX_LEVEL: usize = 28;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size`, region or alignment. (e.g. unaligned)
    InvalidParam,
    /// No enough memory to allocate.
    NoMemory,
    /// Deallocate an unallocated memory region.
    NotAllocated,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

#[inline]
#[allow(dead_code)]
const fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

#[inline]
#[allow(dead_code)]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
#[allow(dead_code)]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

// Export the allocator implementation
pub mod tree;
#[cfg(feature = "tracking")]
pub use tree::TreeStats;
pub use tree::{Block, BuddyTreeAllocator};
