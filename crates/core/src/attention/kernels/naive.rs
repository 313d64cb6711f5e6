//! Reference dense kernel built from standard matrix operations.
//!
//! Works on any device. It serves as:
//! - Reference implementation for checking the dense path numerically
//! - Fallback when FlashAttention is not compiled in
//! - CPU-compatible implementation

use candle_core::{DType, Tensor};

use super::{DenseAttentionKernel, DenseDecodeArgs, DenseVarlenArgs};
use crate::attention::error::Result;
use crate::attention::ops::sdpa;
use crate::kv_cache::gather_paged;

pub struct NaiveDenseAttention;

impl NaiveDenseAttention {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NaiveDenseAttention {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn host_u32(t: &Tensor) -> Result<Vec<u32>> {
    Ok(t.to_dtype(DType::U32)?.to_vec1()?)
}

pub(crate) fn host_u32_rows(t: &Tensor) -> Result<Vec<Vec<u32>>> {
    Ok(t.to_dtype(DType::U32)?.to_vec2()?)
}

impl DenseAttentionKernel for NaiveDenseAttention {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn varlen(&self, args: &DenseVarlenArgs<'_>) -> Result<Tensor> {
        let (_, num_heads, head_dim) = args.q.dims3()?;
        let cu_q = host_u32(args.cu_seqlens_q)?;
        let cu_k = host_u32(args.cu_seqlens_k)?;
        let block_rows = args.block_table.map(host_u32_rows).transpose()?;

        let num_seqs = cu_q.len().saturating_sub(1);
        let mut outputs = Vec::with_capacity(num_seqs);
        for i in 0..num_seqs {
            let q_start = cu_q[i] as usize;
            let q_len = (cu_q[i + 1] - cu_q[i]) as usize;
            let k_start = cu_k[i] as usize;
            let k_len = (cu_k[i + 1] - cu_k[i]) as usize;

            let q_i = args.q.narrow(0, q_start, q_len)?;
            let (k_i, v_i) = match &block_rows {
                Some(rows) => (
                    gather_paged(args.k, &rows[i], k_len)?,
                    gather_paged(args.v, &rows[i], k_len)?,
                ),
                None => (
                    args.k.narrow(0, k_start, k_len)?,
                    args.v.narrow(0, k_start, k_len)?,
                ),
            };
            outputs.push(sdpa(&q_i, &k_i, &v_i, args.softmax_scale, args.causal)?);
        }

        if outputs.is_empty() {
            return Ok(Tensor::zeros(
                (0, num_heads, head_dim),
                args.q.dtype(),
                args.q.device(),
            )?);
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }

    fn with_kv_cache(&self, args: &DenseDecodeArgs<'_>) -> Result<Tensor> {
        let (batch_size, _, _, _) = args.q.dims4()?;
        let seq_lens = host_u32(args.cache_seqlens)?;
        let block_rows = host_u32_rows(args.block_table)?;

        let mut outputs = Vec::with_capacity(batch_size);
        for (b, (&kv_len, blocks)) in seq_lens.iter().zip(block_rows.iter()).take(batch_size).enumerate() {
            // [1, num_heads, head_dim]
            let q_b = args.q.get(b)?;
            let k_b = gather_paged(args.key_cache, blocks, kv_len as usize)?;
            let v_b = gather_paged(args.value_cache, blocks, kv_len as usize)?;
            outputs.push(sdpa(&q_b, &k_b, &v_b, args.softmax_scale, true)?);
        }
        Ok(Tensor::stack(&outputs, 0)?)
    }
}
