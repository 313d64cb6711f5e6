//! Helpers shared by the integration tests.

use std::sync::Mutex;

use candle_core::{DType, Device, Tensor};
use hip_attn_core::attention::hip::{HipAttentionParams, SeqGroupInput};
use hip_attn_core::attention::kernels::{
    DenseAttentionKernel, DenseDecodeArgs, DenseVarlenArgs, MaskMetadata, PagedKvArgs,
    SparseAttentionKernel,
};
use hip_attn_core::attention::utils::exclusive_prefix_sum;
use hip_attn_core::attention::{NaiveDenseAttention, Result};
use hip_attn_core::kv_cache::{BlockId, SeqId};

pub const HEADS: usize = 4;
pub const KV_HEADS: usize = 2;
pub const HEAD_SIZE: usize = 32;

/// A "sparse" kernel that keeps every key, so its output equals exact
/// attention. Records whether each decode call received a previous mask.
#[derive(Default)]
pub struct ExactSparseKernel {
    pub decode_calls: Mutex<Vec<bool>>,
    pub prefill_calls: Mutex<usize>,
}

impl SparseAttentionKernel for ExactSparseKernel {
    fn name(&self) -> &'static str {
        "exact-sparse"
    }

    fn varlen(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        seq_lens: &[usize],
        softmax_scale: f32,
        _params: &HipAttentionParams,
    ) -> Result<Tensor> {
        *self.prefill_calls.lock().unwrap() += 1;
        let cu = exclusive_prefix_sum(seq_lens);
        let cu = Tensor::from_vec(cu, (seq_lens.len() + 1,), q.device())?;
        let max_len = seq_lens.iter().copied().max().unwrap_or(0);
        NaiveDenseAttention::new().varlen(&DenseVarlenArgs {
            q,
            k,
            v,
            cu_seqlens_q: &cu,
            cu_seqlens_k: &cu,
            max_seqlen_q: max_len,
            max_seqlen_k: max_len,
            softmax_scale,
            causal: true,
            block_table: None,
        })
    }

    fn paged_varlen(
        &self,
        q: &Tensor,
        _seq_lens: &[usize],
        _softmax_scale: f32,
        _cache: &PagedKvArgs<'_>,
        _params: &HipAttentionParams,
    ) -> Result<Tensor> {
        *self.prefill_calls.lock().unwrap() += 1;
        Ok(q.zeros_like()?)
    }

    fn paged(
        &self,
        q: &Tensor,
        softmax_scale: f32,
        cache: &PagedKvArgs<'_>,
        _params: &HipAttentionParams,
        previous_mask: Option<&MaskMetadata>,
    ) -> Result<(Tensor, MaskMetadata)> {
        self.decode_calls.lock().unwrap().push(previous_mask.is_some());
        let out = NaiveDenseAttention::new().with_kv_cache(&DenseDecodeArgs {
            q,
            key_cache: cache.key_cache,
            value_cache: cache.value_cache,
            block_table: cache.block_table,
            cache_seqlens: cache.cache_seq_lens,
            softmax_scale,
        })?;
        Ok((out, MaskMetadata::default()))
    }
}

pub fn prompt(seq_id: SeqId, len: usize, blocks: Vec<BlockId>) -> SeqGroupInput {
    SeqGroupInput {
        seq_ids: vec![seq_id],
        input_token_lens: vec![len],
        orig_seq_lens: vec![len],
        seq_lens: vec![len],
        query_lens: vec![len],
        context_lens: vec![0],
        curr_sliding_window_blocks: vec![0],
        block_tables: Some([(seq_id, blocks)].into_iter().collect()),
        is_prompt: true,
        prefix_cache_hit: false,
    }
}

pub fn decode(seq_id: SeqId, seq_len: usize, blocks: Vec<BlockId>) -> SeqGroupInput {
    SeqGroupInput {
        seq_ids: vec![seq_id],
        input_token_lens: vec![1],
        orig_seq_lens: vec![seq_len],
        seq_lens: vec![seq_len],
        query_lens: vec![1],
        context_lens: vec![seq_len - 1],
        curr_sliding_window_blocks: vec![0],
        block_tables: Some([(seq_id, blocks)].into_iter().collect()),
        is_prompt: false,
        prefix_cache_hit: false,
    }
}

/// Random `(query, key, value)` rows for `num_tokens` tokens.
pub fn qkv(num_tokens: usize) -> (Tensor, Tensor, Tensor) {
    let device = Device::Cpu;
    (
        Tensor::randn(0.0f32, 1.0, (num_tokens, HEADS * HEAD_SIZE), &device).unwrap(),
        Tensor::randn(0.0f32, 1.0, (num_tokens, KV_HEADS * HEAD_SIZE), &device).unwrap(),
        Tensor::randn(0.0f32, 1.0, (num_tokens, KV_HEADS * HEAD_SIZE), &device).unwrap(),
    )
}

pub fn heads(t: &Tensor, n: usize) -> Tensor {
    t.reshape(((), n, HEAD_SIZE)).unwrap()
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

pub fn zeros_cache(shape: [usize; 5]) -> Tensor {
    Tensor::zeros(shape.to_vec(), DType::F32, &Device::Cpu).unwrap()
}

/// Install a test subscriber so `RUST_LOG=debug cargo test` shows events.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
