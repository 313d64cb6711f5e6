pub mod backend;
pub mod error;
pub mod hip;
pub mod kernels;
pub mod ops;
pub mod utils;

pub use backend::{AttentionBackend, AttentionType};
pub use error::{HipAttentionError, Result};
pub use kernels::{
    DenseAttentionKernel, FlashDenseAttention, MaskMetadata, NaiveDenseAttention,
    SparseAttentionKernel,
};
