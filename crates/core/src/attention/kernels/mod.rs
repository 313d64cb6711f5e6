//! Kernel interfaces the attention dispatcher calls into.
//!
//! Dense kernels follow the FlashAttention varlen / with-kvcache calling
//! convention. Sparse kernels take the HiP mask parameters and, for decode,
//! return a [`MaskMetadata`] that may be fed back on the next step.

pub mod flash;
pub mod naive;

use candle_core::Tensor;

use super::error::Result;
use super::hip::HipAttentionParams;

pub use flash::FlashDenseAttention;
pub use naive::NaiveDenseAttention;

/// Arguments of a variable-length dense attention call.
///
/// Without a block table, `k`/`v` are packed per-token tensors
/// `[total_k, num_kv_heads, head_size]`. With a block table they are the key
/// and value cache planes `[num_blocks, block_size, num_kv_heads, head_size]`
/// and `cu_seqlens_k` describes the cached lengths.
#[derive(Debug, Clone, Copy)]
pub struct DenseVarlenArgs<'a> {
    /// `[total_q, num_heads, head_size]`
    pub q: &'a Tensor,
    pub k: &'a Tensor,
    pub v: &'a Tensor,
    pub cu_seqlens_q: &'a Tensor,
    pub cu_seqlens_k: &'a Tensor,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub softmax_scale: f32,
    pub causal: bool,
    pub block_table: Option<&'a Tensor>,
}

/// Arguments of a dense decode call over the paged cache.
#[derive(Debug, Clone, Copy)]
pub struct DenseDecodeArgs<'a> {
    /// `[batch, 1, num_heads, head_size]`
    pub q: &'a Tensor,
    pub key_cache: &'a Tensor,
    pub value_cache: &'a Tensor,
    /// `[batch, max_blocks]`
    pub block_table: &'a Tensor,
    /// `[batch]` tokens in the cache per sequence.
    pub cache_seqlens: &'a Tensor,
    pub softmax_scale: f32,
}

/// Dense (exact) attention kernel.
pub trait DenseAttentionKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `[total_q, num_heads, head_size]`.
    fn varlen(&self, args: &DenseVarlenArgs<'_>) -> Result<Tensor>;

    /// Returns `[batch, 1, num_heads, head_size]`.
    fn with_kv_cache(&self, args: &DenseDecodeArgs<'_>) -> Result<Tensor>;
}

/// Paged-cache view passed to the sparse kernels.
#[derive(Debug, Clone, Copy)]
pub struct PagedKvArgs<'a> {
    pub key_cache: &'a Tensor,
    pub value_cache: &'a Tensor,
    pub block_table: &'a Tensor,
    pub cache_seq_lens: &'a Tensor,
}

/// Sparse-mask descriptor produced by a HiP decode call. Opaque to the
/// dispatcher; only the kernel that produced it interprets the tensors.
#[derive(Debug, Clone, Default)]
pub struct MaskMetadata {
    pub indices: Option<Tensor>,
    pub ks: Option<Tensor>,
    pub ks_count: Option<Tensor>,
    pub ks_start_end: Option<Tensor>,
}

/// Hierarchical-pruning sparse attention kernel.
pub trait SparseAttentionKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prompt-only attention over packed `q`/`k`/`v` `[total_tokens, heads, head_size]`.
    fn varlen(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        seq_lens: &[usize],
        softmax_scale: f32,
        params: &HipAttentionParams,
    ) -> Result<Tensor>;

    /// Prefill over the paged cache (prefix caching / chunked prefill).
    fn paged_varlen(
        &self,
        q: &Tensor,
        seq_lens: &[usize],
        softmax_scale: f32,
        cache: &PagedKvArgs<'_>,
        params: &HipAttentionParams,
    ) -> Result<Tensor>;

    /// Decode over the paged cache. `q` is `[batch, q_len, heads, head_size]`;
    /// the output has the same shape. When `previous_mask` is given the kernel
    /// may reuse it instead of recomputing the mask.
    fn paged(
        &self,
        q: &Tensor,
        softmax_scale: f32,
        cache: &PagedKvArgs<'_>,
        params: &HipAttentionParams,
        previous_mask: Option<&MaskMetadata>,
    ) -> Result<(Tensor, MaskMetadata)>;
}
