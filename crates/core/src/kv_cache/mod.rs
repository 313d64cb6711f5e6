//! Paged KV-cache primitives used by the attention backends.
//!
//! Block allocation and eviction belong to the cache manager; this module only
//! reads and writes blocks of a cache tensor it is handed.

mod cache_ops;
mod error;

pub use cache_ops::{allocate_kv_cache, copy_blocks, gather_paged, swap_blocks, PagedKvCache};
pub use error::CacheError;

/// Physical block index inside a paged KV cache.
pub type BlockId = usize;

/// Sequence identifier assigned by the scheduler.
pub type SeqId = u64;
