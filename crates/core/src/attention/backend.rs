//! Attention backend capability trait.
//!
//! A backend describes what it supports (head sizes, KV-cache layout) and
//! owns the block-level cache maintenance the scheduler asks for between
//! steps. The per-layer compute lives in the backend's implementation type.

use candle_core::Tensor;

use super::error::Result;
use crate::kv_cache::BlockId;

/// Which attention a layer performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttentionType {
    /// Causal self-attention over the decoder's own KV cache.
    #[default]
    Decoder,
    Encoder,
    EncoderOnly,
    EncoderDecoder,
}

pub trait AttentionBackend: Send + Sync {
    /// Returns the name of this backend.
    fn name(&self) -> &'static str;

    fn supported_head_sizes(&self) -> &'static [usize];

    fn supports_head_size(&self, head_size: usize) -> bool {
        self.supported_head_sizes().contains(&head_size)
    }

    /// Shape of the KV cache tensor this backend reads and writes.
    fn kv_cache_shape(
        &self,
        num_blocks: usize,
        block_size: usize,
        num_kv_heads: usize,
        head_size: usize,
    ) -> Result<[usize; 5]>;

    /// Copy blocks `src_block -> dst_block` from `src` into `dst` (both planes).
    fn swap_blocks(&self, src: &Tensor, dst: &Tensor, mapping: &[(BlockId, BlockId)])
        -> Result<()>;

    /// Copy blocks within every cache of `caches` (both planes).
    fn copy_blocks(&self, caches: &[Tensor], mapping: &[(BlockId, BlockId)]) -> Result<()>;
}
