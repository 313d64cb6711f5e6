//! Per-step attention metadata and its prefill/decode views.
//!
//! Token ordering inside a batch is fixed: every prefill token first, then one
//! token per decode sequence. Both views are narrows of the batch tensors and
//! are built at most once per metadata instance.

use std::fmt;
use std::sync::OnceLock;

use candle_core::Tensor;

use crate::attention::error::{HipAttentionError, Result};

/// Lazily built prefill/decode projections of one [`HipAttentionMetadata`].
///
/// Cloning yields an empty cache so a clone never aliases another instance's
/// views.
#[derive(Default)]
pub struct MetadataViews {
    prefill: OnceLock<Box<HipAttentionMetadata>>,
    decode: OnceLock<Box<HipAttentionMetadata>>,
}

impl Clone for MetadataViews {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl fmt::Debug for MetadataViews {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataViews")
            .field("prefill_cached", &self.prefill.get().is_some())
            .field("decode_cached", &self.decode.get().is_some())
            .finish()
    }
}

/// Attention metadata for one scheduling step.
//
// context_len: tokens already in the KV cache
// query_len:   new tokens of this step
// seq_len:     context_len + query_len
#[derive(Debug, Clone)]
pub struct HipAttentionMetadata {
    pub num_prefills: usize,
    pub num_prefill_tokens: usize,
    pub num_decode_tokens: usize,
    /// `[num_tokens]` I64 cache slot of every token, `PAD_SLOT_ID` to skip.
    pub slot_mapping: Tensor,
    /// Sequence length per sequence. `None` in the decode view.
    pub seq_lens: Option<Vec<usize>>,
    /// `[num_seqs]` U32.
    pub seq_lens_tensor: Option<Tensor>,
    /// `None` in the decode view.
    pub max_query_len: Option<usize>,
    /// 0 when the batch has no prefills.
    pub max_prefill_seq_len: usize,
    /// 0 when the batch has no decodes.
    pub max_decode_seq_len: usize,
    /// `[num_seqs + 1]` U32 cumulative query lengths, e.g. `[0, 4, 10]` for `[4, 6]`.
    pub query_start_loc: Option<Tensor>,
    /// `[num_seqs + 1]` U32 cumulative sequence lengths.
    pub seq_start_loc: Option<Tensor>,
    /// `[num_seqs]` U32 tokens already computed per sequence.
    pub context_lens_tensor: Option<Tensor>,
    /// `[num_seqs, max_blocks_per_seq]` U32 physical block ids, zero padded.
    pub block_tables: Option<Tensor>,
    /// Decode is replayed from a captured graph.
    pub use_cuda_graph: bool,
    pub views: MetadataViews,
}

fn required<'a>(value: &'a Option<Tensor>, name: &'static str) -> Result<&'a Tensor> {
    value.as_ref().ok_or(HipAttentionError::MissingMetadata(name))
}

/// Rows `[start, end)` of a tensor whose length is its first dimension.
fn rows_from(t: &Tensor, start: usize) -> Result<Tensor> {
    let len = t.dim(0)?;
    Ok(t.narrow(0, start, len.saturating_sub(start))?)
}

impl HipAttentionMetadata {
    pub fn num_tokens(&self) -> usize {
        self.num_prefill_tokens + self.num_decode_tokens
    }

    /// View over the prefill sequences, `None` without prefills.
    pub fn prefill_metadata(&self) -> Result<Option<&HipAttentionMetadata>> {
        if self.num_prefills == 0 {
            return Ok(None);
        }
        if let Some(view) = self.views.prefill.get() {
            return Ok(Some(view));
        }
        let view = self.build_prefill_view()?;
        Ok(Some(self.views.prefill.get_or_init(|| Box::new(view))))
    }

    /// View over the decode sequences, `None` without decode tokens.
    pub fn decode_metadata(&self) -> Result<Option<&HipAttentionMetadata>> {
        if self.num_decode_tokens == 0 {
            return Ok(None);
        }
        if let Some(view) = self.views.decode.get() {
            return Ok(Some(view));
        }
        let view = self.build_decode_view()?;
        Ok(Some(self.views.decode.get_or_init(|| Box::new(view))))
    }

    fn build_prefill_view(&self) -> Result<HipAttentionMetadata> {
        let n = self.num_prefills;
        let seq_lens = self
            .seq_lens
            .as_ref()
            .ok_or(HipAttentionError::MissingMetadata("seq_lens"))?;

        Ok(HipAttentionMetadata {
            num_prefills: n,
            num_prefill_tokens: self.num_prefill_tokens,
            num_decode_tokens: 0,
            slot_mapping: self.slot_mapping.narrow(0, 0, self.num_prefill_tokens)?,
            seq_lens: Some(seq_lens[..n.min(seq_lens.len())].to_vec()),
            seq_lens_tensor: Some(required(&self.seq_lens_tensor, "seq_lens_tensor")?.narrow(0, 0, n)?),
            max_query_len: self.max_query_len,
            max_prefill_seq_len: self.max_prefill_seq_len,
            max_decode_seq_len: 0,
            query_start_loc: Some(required(&self.query_start_loc, "query_start_loc")?.narrow(0, 0, n + 1)?),
            seq_start_loc: Some(required(&self.seq_start_loc, "seq_start_loc")?.narrow(0, 0, n + 1)?),
            context_lens_tensor: Some(
                required(&self.context_lens_tensor, "context_lens_tensor")?.narrow(0, 0, n)?,
            ),
            block_tables: Some(required(&self.block_tables, "block_tables")?.narrow(0, 0, n)?),
            use_cuda_graph: false,
            views: MetadataViews::default(),
        })
    }

    fn build_decode_view(&self) -> Result<HipAttentionMetadata> {
        let n = self.num_prefills;
        Ok(HipAttentionMetadata {
            num_prefills: 0,
            num_prefill_tokens: 0,
            num_decode_tokens: self.num_decode_tokens,
            slot_mapping: rows_from(&self.slot_mapping, self.num_prefill_tokens)?,
            seq_lens: None,
            seq_lens_tensor: Some(rows_from(required(&self.seq_lens_tensor, "seq_lens_tensor")?, n)?),
            max_query_len: None,
            max_prefill_seq_len: 0,
            max_decode_seq_len: self.max_decode_seq_len,
            query_start_loc: None,
            seq_start_loc: None,
            context_lens_tensor: None,
            block_tables: Some(rows_from(required(&self.block_tables, "block_tables")?, n)?),
            use_cuda_graph: self.use_cuda_graph,
            views: MetadataViews::default(),
        })
    }
}
