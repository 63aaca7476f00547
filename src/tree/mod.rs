//! Buddy tree allocator module
//!
//! This module provides a complete implicit-tree buddy system with:
//! - Packed 2-bit node states for the whole block hierarchy
//! - Self-hosted or caller-provided tree storage
//! - In-place grow and shrink of live blocks

pub mod allocator;
#[cfg(feature = "tracking")]
pub mod stats;

mod geometry;
mod state;

pub use allocator::{Block, BuddyTreeAllocator};
#[cfg(feature = "tracking")]
pub use stats::TreeStats;
