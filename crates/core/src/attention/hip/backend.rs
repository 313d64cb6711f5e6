//! HiP attention backend descriptor.

use candle_core::Tensor;

use super::builder::{BuilderContext, HipAttentionMetadataBuilder};
use crate::attention::backend::AttentionBackend;
use crate::attention::error::{HipAttentionError, Result};
use crate::kv_cache::{self, BlockId};

pub const SUPPORTED_HEAD_SIZES: &[usize] = &[16, 32, 64, 128, 256, 512, 1024];

/// Cache block sizes must be a multiple of this.
pub const BLOCK_SIZE_ALIGNMENT: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct HipAttentionBackend;

impl HipAttentionBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn make_metadata_builder(&self, ctx: BuilderContext) -> HipAttentionMetadataBuilder {
        HipAttentionMetadataBuilder::new(ctx)
    }
}

pub(crate) fn check_block_size(block_size: usize) -> Result<()> {
    if block_size == 0 || block_size % BLOCK_SIZE_ALIGNMENT != 0 {
        return Err(HipAttentionError::InvalidBlockSize(block_size));
    }
    Ok(())
}

impl AttentionBackend for HipAttentionBackend {
    fn name(&self) -> &'static str {
        "hip-attn"
    }

    fn supported_head_sizes(&self) -> &'static [usize] {
        SUPPORTED_HEAD_SIZES
    }

    fn kv_cache_shape(
        &self,
        num_blocks: usize,
        block_size: usize,
        num_kv_heads: usize,
        head_size: usize,
    ) -> Result<[usize; 5]> {
        check_block_size(block_size)?;
        Ok([2, num_blocks, block_size, num_kv_heads, head_size])
    }

    fn swap_blocks(&self, src: &Tensor, dst: &Tensor, mapping: &[(BlockId, BlockId)]) -> Result<()> {
        Ok(kv_cache::swap_blocks(src, dst, mapping)?)
    }

    fn copy_blocks(&self, caches: &[Tensor], mapping: &[(BlockId, BlockId)]) -> Result<()> {
        Ok(kv_cache::copy_blocks(caches, mapping)?)
    }
}
