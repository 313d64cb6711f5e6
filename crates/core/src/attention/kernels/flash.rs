//! FlashAttention-2 dense kernel using candle-flash-attn.
//!
//! Requires the `flash-attn` feature and CUDA support. Without the feature
//! every call is delegated to [`NaiveDenseAttention`].

use candle_core::Tensor;

use super::{DenseAttentionKernel, DenseDecodeArgs, DenseVarlenArgs};
use crate::attention::error::Result;

#[cfg(feature = "flash-attn")]
use super::naive::{host_u32, host_u32_rows};
#[cfg(feature = "flash-attn")]
use crate::attention::utils::exclusive_prefix_sum;
#[cfg(feature = "flash-attn")]
use crate::kv_cache::gather_paged;
#[cfg(feature = "flash-attn")]
use candle_core::DType;

pub struct FlashDenseAttention;

impl FlashDenseAttention {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FlashDenseAttention {
    fn default() -> Self {
        Self::new()
    }
}

/// FlashAttention only runs in F16/BF16.
#[cfg(feature = "flash-attn")]
fn fa_dtype(dtype: DType) -> DType {
    if dtype == DType::F16 || dtype == DType::BF16 {
        dtype
    } else {
        DType::BF16
    }
}

/// Concatenate the cached tokens of every sequence into one packed
/// `[total_k, num_kv_heads, head_size]` tensor.
#[cfg(feature = "flash-attn")]
fn gather_packed(
    cache_plane: &Tensor,
    block_rows: &[Vec<u32>],
    kv_lens: &[usize],
) -> Result<Tensor> {
    let parts = block_rows
        .iter()
        .zip(kv_lens)
        .map(|(blocks, &len)| gather_paged(cache_plane, blocks, len))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Tensor::cat(&parts, 0)?)
}

#[cfg(feature = "flash-attn")]
impl DenseAttentionKernel for FlashDenseAttention {
    fn name(&self) -> &'static str {
        "flash-attention"
    }

    fn varlen(&self, args: &DenseVarlenArgs<'_>) -> Result<Tensor> {
        let orig_dtype = args.q.dtype();
        let dtype = fa_dtype(orig_dtype);

        let (k, v) = match args.block_table {
            Some(block_table) => {
                let cu_k = host_u32(args.cu_seqlens_k)?;
                let kv_lens: Vec<usize> = cu_k.windows(2).map(|w| (w[1] - w[0]) as usize).collect();
                let rows = host_u32_rows(block_table)?;
                (
                    gather_packed(args.k, &rows, &kv_lens)?,
                    gather_packed(args.v, &rows, &kv_lens)?,
                )
            }
            None => (args.k.clone(), args.v.clone()),
        };

        let output = candle_flash_attn::flash_attn_varlen(
            &args.q.to_dtype(dtype)?,
            &k.to_dtype(dtype)?,
            &v.to_dtype(dtype)?,
            &args.cu_seqlens_q.to_dtype(DType::U32)?,
            &args.cu_seqlens_k.to_dtype(DType::U32)?,
            args.max_seqlen_q,
            args.max_seqlen_k,
            args.softmax_scale,
            args.causal,
        )?;
        Ok(output.to_dtype(orig_dtype)?)
    }

    fn with_kv_cache(&self, args: &DenseDecodeArgs<'_>) -> Result<Tensor> {
        let (batch_size, q_len, num_heads, head_dim) = args.q.dims4()?;
        let orig_dtype = args.q.dtype();
        let dtype = fa_dtype(orig_dtype);
        let device = args.q.device();

        let kv_lens: Vec<usize> = host_u32(args.cache_seqlens)?
            .into_iter()
            .take(batch_size)
            .map(|l| l as usize)
            .collect();
        let rows = host_u32_rows(args.block_table)?;
        let k = gather_packed(args.key_cache, &rows, &kv_lens)?;
        let v = gather_packed(args.value_cache, &rows, &kv_lens)?;

        let q_lens = vec![q_len; batch_size];
        let cu_q = exclusive_prefix_sum(&q_lens);
        let cu_k = exclusive_prefix_sum(&kv_lens);
        let max_seqlen_k = kv_lens.iter().copied().max().unwrap_or(0);

        let q = args.q.reshape((batch_size * q_len, num_heads, head_dim))?;
        let output = candle_flash_attn::flash_attn_varlen(
            &q.to_dtype(dtype)?,
            &k.to_dtype(dtype)?,
            &v.to_dtype(dtype)?,
            &Tensor::from_vec(cu_q, (batch_size + 1,), device)?,
            &Tensor::from_vec(cu_k, (batch_size + 1,), device)?,
            q_len,
            max_seqlen_k,
            args.softmax_scale,
            true,
        )?;
        Ok(output
            .to_dtype(orig_dtype)?
            .reshape((batch_size, q_len, num_heads, head_dim))?)
    }
}

#[cfg(not(feature = "flash-attn"))]
use super::naive::NaiveDenseAttention;

/// When the flash-attn feature is disabled, FlashDenseAttention delegates to
/// NaiveDenseAttention.
#[cfg(not(feature = "flash-attn"))]
impl DenseAttentionKernel for FlashDenseAttention {
    fn name(&self) -> &'static str {
        "flash-attention-fallback-to-naive"
    }

    fn varlen(&self, args: &DenseVarlenArgs<'_>) -> Result<Tensor> {
        NaiveDenseAttention::new().varlen(args)
    }

    fn with_kv_cache(&self, args: &DenseDecodeArgs<'_>) -> Result<Tensor> {
        NaiveDenseAttention::new().with_kv_cache(args)
    }
}
