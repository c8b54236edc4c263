//! A lock-free sorted set over an ordered singly-linked chain.
//!
//! Deletion is two-phase: a node is first marked as logically deleted by
//! setting a bit packed into its `next` pointer, then physically unlinked
//! by whichever traversal gets there first. Unlinked nodes are reclaimed
//! through epoch-based reclamation, never while another thread may still
//! be traversing them.

use once_cell::sync::Lazy;

pub mod epoch_manager;
pub mod error;
pub mod node;
pub mod node_allocator;
pub mod sorted_set;

/// Alignment for cache lines (typically 64 bytes on modern CPUs)
pub(crate) static CACHE_LINE_SIZE: Lazy<usize> = Lazy::new(|| {
    // Try data cache first (most relevant for our use case)
    cache_size::cache_line_size(1, cache_size::CacheType::Data)
        // Fall back to unified cache if data cache info isn't available
        .or_else(|| cache_size::cache_line_size(1, cache_size::CacheType::Unified))
        // Try L2 cache if L1 isn't available
        .or_else(|| cache_size::cache_line_size(2, cache_size::CacheType::Data))
        .or_else(|| cache_size::cache_line_size(2, cache_size::CacheType::Unified))
        // Default to 64 bytes if all detection fails
        .unwrap_or(64)
});
