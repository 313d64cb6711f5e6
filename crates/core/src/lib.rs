//! HiP attention backend for a paged-KV-cache inference engine.
//!
//! - [`attention::hip`]: configuration, metadata building and the per-layer
//!   dispatcher
//! - [`attention::kernels`]: kernel traits and the dense kernels
//! - [`kv_cache`]: block-level cache operations

pub mod attention;
pub mod kv_cache;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
