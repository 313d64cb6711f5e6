//! Per-layer HiP attention forward.
//!
//! The batch layout the dispatcher expects:
//!
//! ```text
//! |<------- num_prefill_tokens ------->|<------ num_decode_tokens ------>|
//! |<-prefill_0->|...|<-prefill_N-1->|<-decode_0->|...|<-decode_M-1->|<-pad->|
//! ```
//!
//! Prompts have varying lengths and no padding; decode tokens are one per
//! sequence and may be padded when decode replays a captured graph.

use std::sync::Arc;

use candle_core::Tensor;
use tracing::{trace, warn};

use super::backend::{check_block_size, SUPPORTED_HEAD_SIZES};
use super::config::HipConfig;
use super::metadata::HipAttentionMetadata;
use super::state::LayerAttentionState;
use crate::attention::backend::AttentionType;
use crate::attention::error::{HipAttentionError, Result};
use crate::attention::kernels::{
    DenseAttentionKernel, DenseDecodeArgs, DenseVarlenArgs, PagedKvArgs, SparseAttentionKernel,
};
use crate::kv_cache::PagedKvCache;

/// Kernel family a token range is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionPath {
    Dense,
    Sparse,
}

/// Prefill runs dense when the longest sequence is under `HIP_SEQ_THRESH`,
/// when dense prefill is forced, or for a dense layer.
pub fn select_prefill_path(layer_index: usize, max_seq_len: usize, config: &HipConfig) -> AttentionPath {
    if (max_seq_len as i64) < config.seq_threshold
        || config.prefill_always_dense
        || config.is_dense_layer(layer_index)
    {
        AttentionPath::Dense
    } else {
        AttentionPath::Sparse
    }
}

pub fn select_decode_path(layer_index: usize, force_dense: bool, config: &HipConfig) -> AttentionPath {
    if config.is_dense_layer(layer_index) || force_dense {
        AttentionPath::Dense
    } else {
        AttentionPath::Sparse
    }
}

/// Construction parameters of one attention layer.
#[derive(Debug, Clone)]
pub struct AttentionLayerConfig {
    pub num_heads: usize,
    pub head_size: usize,
    pub scale: f32,
    pub num_kv_heads: usize,
    pub alibi_slopes: Option<Vec<f32>>,
    pub sliding_window: Option<usize>,
    pub blocksparse_params: Option<serde_json::Value>,
    pub logits_soft_cap: Option<f32>,
    pub layer_index: usize,
}

impl AttentionLayerConfig {
    pub fn new(num_heads: usize, num_kv_heads: usize, head_size: usize, layer_index: usize) -> Self {
        Self {
            num_heads,
            head_size,
            scale: 1.0 / (head_size as f32).sqrt(),
            num_kv_heads,
            alibi_slopes: None,
            sliding_window: None,
            blocksparse_params: None,
            logits_soft_cap: None,
            layer_index,
        }
    }
}

/// Stateless attention implementation of one layer. Mutable per-layer state
/// is passed to [`forward`](Self::forward) as a [`LayerAttentionState`].
pub struct HipAttentionImpl {
    num_heads: usize,
    head_size: usize,
    scale: f32,
    num_kv_heads: usize,
    alibi_slopes: Option<Vec<f32>>,
    /// 0 means no soft cap.
    logits_soft_cap: f32,
    layer_index: usize,
    config: Arc<HipConfig>,
    dense: Arc<dyn DenseAttentionKernel>,
    sparse: Arc<dyn SparseAttentionKernel>,
}

impl std::fmt::Debug for HipAttentionImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HipAttentionImpl")
            .field("num_heads", &self.num_heads)
            .field("num_kv_heads", &self.num_kv_heads)
            .field("head_size", &self.head_size)
            .field("layer_index", &self.layer_index)
            .field("dense", &self.dense.name())
            .field("sparse", &self.sparse.name())
            .finish()
    }
}

impl HipAttentionImpl {
    pub fn new(
        layer: AttentionLayerConfig,
        config: Arc<HipConfig>,
        dense: Arc<dyn DenseAttentionKernel>,
        sparse: Arc<dyn SparseAttentionKernel>,
    ) -> Result<Self> {
        if layer.blocksparse_params.is_some() {
            return Err(HipAttentionError::UnsupportedFeature("block-sparse attention"));
        }
        // The sparse kernels cannot apply a sliding window over the paged cache.
        if layer.sliding_window.is_some() {
            return Err(HipAttentionError::UnsupportedFeature("sliding window"));
        }
        if !SUPPORTED_HEAD_SIZES.contains(&layer.head_size) {
            return Err(HipAttentionError::UnsupportedHeadSize {
                head_size: layer.head_size,
                supported: SUPPORTED_HEAD_SIZES,
            });
        }
        if layer.num_kv_heads == 0 || layer.num_heads % layer.num_kv_heads != 0 {
            return Err(HipAttentionError::ShapeMismatch {
                what: "num_heads divisible by num_kv_heads",
                expected: vec![layer.num_kv_heads],
                actual: vec![layer.num_heads],
            });
        }

        Ok(Self {
            num_heads: layer.num_heads,
            head_size: layer.head_size,
            scale: layer.scale,
            num_kv_heads: layer.num_kv_heads,
            alibi_slopes: layer.alibi_slopes,
            logits_soft_cap: layer.logits_soft_cap.unwrap_or(0.0),
            layer_index: layer.layer_index,
            config,
            dense,
            sparse,
        })
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn num_queries_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    fn reject_alibi(&self) -> Result<()> {
        if self.alibi_slopes.is_some() {
            return Err(HipAttentionError::UnsupportedFeature("ALiBi slopes"));
        }
        Ok(())
    }

    fn reject_soft_cap(&self) -> Result<()> {
        if self.logits_soft_cap != 0.0 {
            return Err(HipAttentionError::UnsupportedFeature("logits soft cap"));
        }
        Ok(())
    }

    fn check_cache(&self, cache: &PagedKvCache<'_>) -> Result<()> {
        check_block_size(cache.block_size())?;
        if cache.num_kv_heads() != self.num_kv_heads || cache.head_size() != self.head_size {
            return Err(HipAttentionError::ShapeMismatch {
                what: "kv cache heads",
                expected: vec![self.num_kv_heads, self.head_size],
                actual: vec![cache.num_kv_heads(), cache.head_size()],
            });
        }
        Ok(())
    }

    fn check_output(&self, what: &'static str, out: &Tensor, expected: &[usize]) -> Result<()> {
        if out.dims() != expected {
            return Err(HipAttentionError::ShapeMismatch {
                what,
                expected: expected.to_vec(),
                actual: out.dims().to_vec(),
            });
        }
        Ok(())
    }

    /// Attention over one batch.
    ///
    /// `query` is `[num_tokens, num_heads * head_size]`, `key`/`value` are
    /// `[num_tokens, num_kv_heads * head_size]` and `kv_cache` is
    /// `[2, num_blocks, block_size, num_kv_heads, head_size]`, or `None` during
    /// the memory profiling run. Returns `[num_tokens, num_heads * head_size]`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        state: &mut LayerAttentionState,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        kv_cache: Option<&Tensor>,
        metadata: &HipAttentionMetadata,
        k_scale: f32,
        v_scale: f32,
        attn_type: AttentionType,
    ) -> Result<Tensor> {
        if attn_type != AttentionType::Decoder {
            return Err(HipAttentionError::NotImplemented(attn_type));
        }
        // No FP8 KV cache.
        if k_scale != 1.0 || v_scale != 1.0 {
            return Err(HipAttentionError::UnsupportedFeature("k_scale/v_scale"));
        }

        let (num_tokens, hidden_size) = query.dims2()?;
        if hidden_size != self.num_heads * self.head_size {
            return Err(HipAttentionError::ShapeMismatch {
                what: "query hidden size",
                expected: vec![self.num_heads * self.head_size],
                actual: vec![hidden_size],
            });
        }
        let query = query.reshape((num_tokens, self.num_heads, self.head_size))?;
        let key = key.reshape(((), self.num_kv_heads, self.head_size))?;
        let value = value.reshape(((), self.num_kv_heads, self.head_size))?;

        let num_prefill_tokens = metadata.num_prefill_tokens;
        let num_decode_tokens = metadata.num_decode_tokens;
        let expected_tokens = num_prefill_tokens + num_decode_tokens;
        for (what, len) in [
            ("key tokens", key.dim(0)?),
            ("value tokens", value.dim(0)?),
            ("query tokens", num_tokens),
        ] {
            if len != expected_tokens {
                return Err(HipAttentionError::ShapeMismatch {
                    what,
                    expected: vec![expected_tokens],
                    actual: vec![len],
                });
            }
        }

        // Without a cache (profiling run) the new keys and values are not stored.
        let planes = match kv_cache {
            Some(kv_cache) => {
                let cache = PagedKvCache::new(kv_cache)?;
                self.check_cache(&cache)?;
                cache.reshape_and_cache(&key, &value, &metadata.slot_mapping)?;
                Some((cache.key_cache()?, cache.value_cache()?))
            }
            None => None,
        };

        let mut outputs = Vec::with_capacity(2);

        if let Some(prefill) = metadata.prefill_metadata()? {
            let query = query.narrow(0, 0, num_prefill_tokens)?;
            let key = key.narrow(0, 0, num_prefill_tokens)?;
            let value = value.narrow(0, 0, num_prefill_tokens)?;
            let out = self.prefill(prefill, planes.as_ref(), &query, &key, &value)?;
            self.check_output(
                "prefill output",
                &out,
                &[num_prefill_tokens, self.num_heads, self.head_size],
            )?;
            outputs.push(out);
        }

        if let Some(decode) = metadata.decode_metadata()? {
            let (key_cache, value_cache) = planes.as_ref().ok_or(HipAttentionError::MissingKvCache)?;
            let query = query.narrow(0, num_prefill_tokens, num_decode_tokens)?;
            let out = self.decode(state, decode, key_cache, value_cache, &query)?;
            outputs.push(out);
        }

        let output = if outputs.is_empty() {
            Tensor::zeros((0, self.num_heads, self.head_size), query.dtype(), query.device())?
        } else {
            Tensor::cat(&outputs, 0)?
        };
        Ok(output.reshape((num_tokens, hidden_size))?)
    }

    fn prefill(
        &self,
        meta: &HipAttentionMetadata,
        planes: Option<&(Tensor, Tensor)>,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<Tensor> {
        self.reject_alibi()?;
        self.reject_soft_cap()?;

        let block_tables = meta
            .block_tables
            .as_ref()
            .filter(|t| t.elem_count() > 0);
        let seq_lens = meta
            .seq_lens
            .as_deref()
            .ok_or(HipAttentionError::MissingMetadata("seq_lens"))?;

        match (planes, block_tables) {
            (Some((key_cache, value_cache)), Some(block_table)) => {
                // Prefix caching or chunked prefill: keys come from the cache.
                let max_seq_len = seq_lens.iter().copied().max().unwrap_or(0);
                let path = select_prefill_path(self.layer_index, max_seq_len, &self.config);
                trace!(layer = self.layer_index, ?path, max_seq_len, "prefix prefill");
                match path {
                    AttentionPath::Dense => {
                        let cu_q = meta
                            .query_start_loc
                            .as_ref()
                            .ok_or(HipAttentionError::MissingMetadata("query_start_loc"))?;
                        let cu_k = meta
                            .seq_start_loc
                            .as_ref()
                            .ok_or(HipAttentionError::MissingMetadata("seq_start_loc"))?;
                        let max_query_len = meta
                            .max_query_len
                            .ok_or(HipAttentionError::MissingMetadata("max_query_len"))?;
                        self.dense.varlen(&DenseVarlenArgs {
                            q: query,
                            k: key_cache,
                            v: value_cache,
                            cu_seqlens_q: cu_q,
                            cu_seqlens_k: cu_k,
                            max_seqlen_q: max_query_len,
                            max_seqlen_k: max_seq_len,
                            softmax_scale: self.scale,
                            causal: true,
                            block_table: Some(block_table),
                        })
                    }
                    AttentionPath::Sparse => {
                        if self.config.show_warnings {
                            warn!(layer = self.layer_index, "HiP is used in prefix prefill");
                        }
                        let cache_seq_lens = meta
                            .seq_lens_tensor
                            .as_ref()
                            .ok_or(HipAttentionError::MissingMetadata("seq_lens_tensor"))?;
                        self.sparse.paged_varlen(
                            query,
                            seq_lens,
                            self.scale,
                            &PagedKvArgs {
                                key_cache,
                                value_cache,
                                block_table,
                                cache_seq_lens,
                            },
                            &self.config.prefill,
                        )
                    }
                }
            }
            _ => {
                // Queries and keys are the prompt itself.
                let path =
                    select_prefill_path(self.layer_index, meta.max_prefill_seq_len, &self.config);
                trace!(
                    layer = self.layer_index,
                    ?path,
                    max_prefill_seq_len = meta.max_prefill_seq_len,
                    "prefill"
                );
                match path {
                    AttentionPath::Dense => {
                        let cu = meta
                            .seq_start_loc
                            .as_ref()
                            .ok_or(HipAttentionError::MissingMetadata("seq_start_loc"))?;
                        self.dense.varlen(&DenseVarlenArgs {
                            q: query,
                            k: key,
                            v: value,
                            cu_seqlens_q: cu,
                            cu_seqlens_k: cu,
                            max_seqlen_q: meta.max_prefill_seq_len,
                            max_seqlen_k: meta.max_prefill_seq_len,
                            softmax_scale: self.scale,
                            causal: true,
                            block_table: None,
                        })
                    }
                    AttentionPath::Sparse => {
                        if self.config.show_warnings {
                            warn!(layer = self.layer_index, "HiP is used in prefill");
                        }
                        self.sparse
                            .varlen(query, key, value, seq_lens, self.scale, &self.config.prefill)
                    }
                }
            }
        }
    }

    fn decode(
        &self,
        state: &mut LayerAttentionState,
        meta: &HipAttentionMetadata,
        key_cache: &Tensor,
        value_cache: &Tensor,
        query: &Tensor,
    ) -> Result<Tensor> {
        self.reject_alibi()?;
        self.reject_soft_cap()?;

        // [batch, 1, num_heads, head_size]
        let query = query.unsqueeze(1)?;
        if state.checkout_query {
            state.last_query = Some(query.clone());
        }
        let batch_size = query.dim(0)?;
        let expected = [batch_size, 1, self.num_heads, self.head_size];

        let block_table = meta
            .block_tables
            .as_ref()
            .ok_or(HipAttentionError::MissingMetadata("block_tables"))?;
        let cache_seq_lens = meta
            .seq_lens_tensor
            .as_ref()
            .ok_or(HipAttentionError::MissingMetadata("seq_lens_tensor"))?;

        let path = select_decode_path(self.layer_index, state.force_dense, &self.config);
        trace!(layer = self.layer_index, ?path, batch_size, "decode");

        let context = match path {
            AttentionPath::Dense => self.dense.with_kv_cache(&DenseDecodeArgs {
                q: &query,
                key_cache,
                value_cache,
                block_table,
                cache_seqlens: cache_seq_lens,
                softmax_scale: self.scale,
            })?,
            AttentionPath::Sparse => {
                if !state.use_last_mask {
                    state.mask.reset();
                }

                let (sparse_query, prefix_len) = match &state.query_prefix {
                    Some(prefix) => (prefix.blend(&query)?, prefix.prefix_len()?),
                    None => (query.clone(), 0),
                };

                if self.config.show_warnings {
                    warn!(layer = self.layer_index, "HiP is used in decode");
                }

                let (context, mask) = self.sparse.paged(
                    &sparse_query,
                    self.scale,
                    &PagedKvArgs {
                        key_cache,
                        value_cache,
                        block_table,
                        cache_seq_lens,
                    },
                    &self.config.decode,
                    state.mask.get(),
                )?;
                self.check_output(
                    "sparse decode output",
                    &context,
                    &[batch_size, prefix_len + 1, self.num_heads, self.head_size],
                )?;

                if state.checkout_last_mask_metadata {
                    state.mask.store(mask);
                }
                context.narrow(1, prefix_len, 1)?
            }
        };
        self.check_output("decode output", &context, &expected)?;

        Ok(context.squeeze(1)?)
    }
}

/// A [`HipAttentionImpl`] bundled with the state it mutates.
#[derive(Debug)]
pub struct HipAttentionLayer {
    inner: HipAttentionImpl,
    state: LayerAttentionState,
}

impl HipAttentionLayer {
    pub fn new(inner: HipAttentionImpl) -> Self {
        Self {
            inner,
            state: LayerAttentionState::new(),
        }
    }

    pub fn state(&self) -> &LayerAttentionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut LayerAttentionState {
        &mut self.state
    }

    /// Decoder self-attention with unit KV scales.
    pub fn forward(
        &mut self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        kv_cache: Option<&Tensor>,
        metadata: &HipAttentionMetadata,
    ) -> Result<Tensor> {
        self.inner.forward(
            &mut self.state,
            query,
            key,
            value,
            kv_cache,
            metadata,
            1.0,
            1.0,
            AttentionType::Decoder,
        )
    }
}
