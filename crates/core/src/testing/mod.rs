//! Shared test utilities for hip-attn-core.
//!
//! Recording mock kernels and small batch fixtures for exercising the
//! dispatcher without real sparse kernels.

mod fixtures;
mod mock_kernels;

pub use fixtures::{decode_group, prompt_group, tiny_layer};
pub use mock_kernels::{MockSparseKernel, SparseCall};
