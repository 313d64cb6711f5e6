//! Builds [`HipAttentionMetadata`] for one scheduling step.

use candle_core::{Device, Tensor};
use tracing::{debug, trace};

use super::metadata::{HipAttentionMetadata, MetadataViews};
use crate::attention::error::{HipAttentionError, Result};
use crate::attention::utils::{
    async_tensor_h2d, compute_slot_mapping, compute_slot_mapping_start_idx,
    exclusive_prefix_sum, is_block_tables_empty, make_tensor_with_pad, SeqBlockTables,
    PAD_SLOT_ID,
};
use crate::kv_cache::{BlockId, SeqId};

/// Model-input record of one sequence group. All per-sequence vectors are
/// parallel to `seq_ids`.
#[derive(Debug, Clone, Default)]
pub struct SeqGroupInput {
    pub seq_ids: Vec<SeqId>,
    /// Number of input tokens fed this step.
    pub input_token_lens: Vec<usize>,
    pub orig_seq_lens: Vec<usize>,
    pub seq_lens: Vec<usize>,
    pub query_lens: Vec<usize>,
    pub context_lens: Vec<usize>,
    /// Trailing blocks to keep under a sliding window, 0 for all.
    pub curr_sliding_window_blocks: Vec<usize>,
    pub block_tables: SeqBlockTables,
    pub is_prompt: bool,
    pub prefix_cache_hit: bool,
}

impl SeqGroupInput {
    /// Every per-sequence vector must have one entry per `seq_ids` element.
    pub fn check_lens(&self) -> Result<()> {
        let n = self.seq_ids.len();
        let fields: [(&'static str, usize); 6] = [
            ("input_token_lens", self.input_token_lens.len()),
            ("orig_seq_lens", self.orig_seq_lens.len()),
            ("seq_lens", self.seq_lens.len()),
            ("query_lens", self.query_lens.len()),
            ("context_lens", self.context_lens.len()),
            ("curr_sliding_window_blocks", self.curr_sliding_window_blocks.len()),
        ];
        for (what, len) in fields {
            if len != n {
                return Err(HipAttentionError::ShapeMismatch {
                    what,
                    expected: vec![n],
                    actual: vec![len],
                });
            }
        }
        Ok(())
    }
}

/// Facts about the model runner the builder depends on.
#[derive(Debug, Clone)]
pub struct BuilderContext {
    pub block_size: usize,
    pub sliding_window: Option<usize>,
    pub use_v2_block_manager: bool,
    pub chunked_prefill_enabled: bool,
    pub device: Device,
}

impl BuilderContext {
    pub fn new(block_size: usize, device: Device) -> Self {
        Self {
            block_size,
            sliding_window: None,
            use_v2_block_manager: false,
            chunked_prefill_enabled: false,
            device,
        }
    }
}

/// Preallocated `[max_batch_size, max_blocks_per_seq]` block-table buffer
/// reused across graph replays.
#[derive(Debug, Clone)]
pub struct GraphBlockTables {
    data: Vec<u32>,
    max_batch_size: usize,
    max_blocks_per_seq: usize,
}

impl GraphBlockTables {
    pub fn new(max_batch_size: usize, max_blocks_per_seq: usize) -> Self {
        Self {
            data: vec![0; max_batch_size * max_blocks_per_seq],
            max_batch_size,
            max_blocks_per_seq,
        }
    }

    /// Sized for sequences of up to `max_context_len` tokens.
    pub fn from_max_context(max_batch_size: usize, max_context_len: usize, block_size: usize) -> Self {
        Self::new(max_batch_size, max_context_len.div_ceil(block_size))
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_blocks_per_seq(&self) -> usize {
        self.max_blocks_per_seq
    }

    /// Write `tables` left-aligned into rows `[0, batch_size)` and return those
    /// rows as a `[batch_size, max_blocks_per_seq]` tensor.
    pub fn fill(&mut self, batch_size: usize, tables: &[Vec<BlockId>], device: &Device) -> Result<Tensor> {
        let longest = tables.iter().map(Vec::len).max().unwrap_or(0);
        if batch_size > self.max_batch_size
            || tables.len() > batch_size
            || longest > self.max_blocks_per_seq
        {
            return Err(HipAttentionError::GraphBufferOverflow {
                capacity_rows: self.max_batch_size,
                capacity_blocks: self.max_blocks_per_seq,
                rows: batch_size.max(tables.len()),
                blocks: longest,
            });
        }

        let width = self.max_blocks_per_seq;
        for (i, row) in self.data.chunks_mut(width.max(1)).take(batch_size).enumerate() {
            row.fill(0);
            if let Some(table) = tables.get(i) {
                for (dst, &block) in row.iter_mut().zip(table) {
                    *dst = block as u32;
                }
            }
        }
        let rows = &self.data[..batch_size * width];
        let host = Tensor::from_slice(rows, (batch_size, width), &Device::Cpu)?;
        Ok(host.to_device(device)?)
    }
}

/// Accumulates per-sequence metadata for one step; consumed by [`build`].
///
/// [`build`]: HipAttentionMetadataBuilder::build
#[derive(Debug)]
pub struct HipAttentionMetadataBuilder {
    ctx: BuilderContext,
    groups: Vec<SeqGroupInput>,

    slot_mapping: Vec<i64>,
    prefill_seq_lens: Vec<usize>,
    context_lens: Vec<usize>,
    block_tables: Vec<Vec<BlockId>>,
    curr_seq_lens: Vec<usize>,
    num_prefills: usize,
    num_prefill_tokens: usize,
    num_decode_tokens: usize,
}

impl HipAttentionMetadataBuilder {
    pub fn new(ctx: BuilderContext) -> Self {
        Self {
            ctx,
            groups: Vec::new(),
            slot_mapping: Vec::new(),
            prefill_seq_lens: Vec::new(),
            context_lens: Vec::new(),
            block_tables: Vec::new(),
            curr_seq_lens: Vec::new(),
            num_prefills: 0,
            num_prefill_tokens: 0,
            num_decode_tokens: 0,
        }
    }

    pub fn context(&self) -> &BuilderContext {
        &self.ctx
    }

    /// Queue a sequence group; it is processed by [`build`](Self::build).
    pub fn add_seq_group_input(&mut self, group: SeqGroupInput) {
        self.groups.push(group);
    }

    /// Append the context length, block table and slot mapping of every
    /// sequence in `group`. Only [`build`](Self::build) calls this, once the
    /// prefix-hit flag of the whole batch is known.
    pub(crate) fn add_seq_group(
        &mut self,
        group: &SeqGroupInput,
        chunked_prefill_enabled: bool,
        prefix_cache_hit: bool,
    ) -> Result<()> {
        group.check_lens()?;
        let is_profile_run = is_block_tables_empty(&group.block_tables);

        for (i, &seq_id) in group.seq_ids.iter().enumerate() {
            let token_len = group.input_token_lens[i];
            let seq_len = group.orig_seq_lens[i];
            let curr_seq_len = group.seq_lens[i];
            let query_len = group.query_lens[i];
            let context_len = group.context_lens[i];
            let curr_sliding_window_block = group.curr_sliding_window_blocks[i];

            self.context_lens.push(context_len);

            if group.is_prompt {
                self.num_prefills += 1;
                self.num_prefill_tokens += token_len;
                self.prefill_seq_lens.push(seq_len);
            } else {
                if query_len != 1 {
                    return Err(HipAttentionError::InvalidDecodeQueryLen {
                        seq_len,
                        context_len,
                        query_len,
                    });
                }
                self.num_decode_tokens += query_len;
                self.curr_seq_lens.push(curr_seq_len);
            }

            let seq_table = || {
                group
                    .block_tables
                    .as_ref()
                    .and_then(|tables| tables.get(&seq_id))
                    .ok_or(HipAttentionError::MissingBlockTable { seq_id })
            };
            // Prefix-cache hits need the entries of the incoming prefill
            // tokens too, so the whole table is kept.
            let block_table = if prefix_cache_hit {
                seq_table()?.clone()
            } else if (chunked_prefill_enabled || !group.is_prompt) && group.block_tables.is_some() {
                let table = seq_table()?;
                if curr_sliding_window_block == 0 {
                    table.clone()
                } else {
                    table[table.len().saturating_sub(curr_sliding_window_block)..].to_vec()
                }
            } else {
                Vec::new()
            };
            self.block_tables.push(block_table);

            let start_idx = compute_slot_mapping_start_idx(
                group.is_prompt,
                query_len,
                context_len,
                self.ctx.sliding_window,
                self.ctx.use_v2_block_manager,
            )?;
            compute_slot_mapping(
                is_profile_run,
                &mut self.slot_mapping,
                seq_id,
                seq_len,
                context_len,
                start_idx,
                self.ctx.block_size,
                &group.block_tables,
            )?;
        }
        Ok(())
    }

    /// Produce the device-resident metadata for the step.
    ///
    /// `seq_lens` / `query_lens` cover every sequence of the batch (already
    /// padded by the caller in graph mode). `cuda_graph_pad_size` is `Some`
    /// when decode replays a captured graph; `batch_size` is then the padded
    /// batch and `graph_block_tables` the buffer to write the tables into.
    pub fn build(
        mut self,
        seq_lens: &[usize],
        query_lens: &[usize],
        cuda_graph_pad_size: Option<usize>,
        batch_size: usize,
        graph_block_tables: Option<&mut GraphBlockTables>,
    ) -> Result<HipAttentionMetadata> {
        let groups = std::mem::take(&mut self.groups);
        let prefix_cache_hit = groups.iter().any(|g| g.prefix_cache_hit);
        let chunked_prefill_enabled = self.ctx.chunked_prefill_enabled;
        for group in &groups {
            self.add_seq_group(group, chunked_prefill_enabled, prefix_cache_hit)?;
        }

        let device = self.ctx.device.clone();
        let max_query_len = query_lens.iter().copied().max().unwrap_or(0);
        if max_query_len == 0 {
            return Err(HipAttentionError::InvalidQueryLens(query_lens.to_vec()));
        }
        let max_prefill_seq_len = self.prefill_seq_lens.iter().copied().max().unwrap_or(0);
        let max_decode_seq_len = self.curr_seq_lens.iter().copied().max().unwrap_or(0);
        let mut num_decode_tokens = self.num_decode_tokens;

        let block_tables = match cuda_graph_pad_size {
            Some(pad) => {
                // Graph replay covers the padded batch, so the caller pads the lengths.
                let padded = [
                    ("graph seq_lens", seq_lens.len()),
                    ("graph query_lens", query_lens.len()),
                ];
                for (what, len) in padded {
                    if len != batch_size {
                        return Err(HipAttentionError::ShapeMismatch {
                            what,
                            expected: vec![batch_size],
                            actual: vec![len],
                        });
                    }
                }
                self.slot_mapping.extend(std::iter::repeat_n(PAD_SLOT_ID, pad));
                num_decode_tokens = batch_size;
                let buffer = graph_block_tables.ok_or(HipAttentionError::GraphBufferMissing)?;
                buffer.fill(batch_size, &self.block_tables, &device)?
            }
            None => make_tensor_with_pad(&self.block_tables, 0, &device)?,
        };

        let to_u32 = |v: &[usize]| v.iter().map(|&x| x as u32).collect::<Vec<u32>>();
        let context_lens_tensor = async_tensor_h2d(&to_u32(&self.context_lens), &device)?;
        let seq_lens_tensor = async_tensor_h2d(&to_u32(seq_lens), &device)?;
        let slot_mapping = async_tensor_h2d(&self.slot_mapping, &device)?;
        let query_start_loc = async_tensor_h2d(&exclusive_prefix_sum(query_lens), &device)?;
        let seq_start_loc = async_tensor_h2d(&exclusive_prefix_sum(seq_lens), &device)?;

        debug!(
            num_prefills = self.num_prefills,
            num_prefill_tokens = self.num_prefill_tokens,
            num_decode_tokens,
            max_query_len,
            max_prefill_seq_len,
            max_decode_seq_len,
            use_cuda_graph = cuda_graph_pad_size.is_some(),
            "built hip attention metadata"
        );
        trace!(slot_mapping = ?self.slot_mapping, block_tables = ?self.block_tables);

        Ok(HipAttentionMetadata {
            num_prefills: self.num_prefills,
            num_prefill_tokens: self.num_prefill_tokens,
            num_decode_tokens,
            slot_mapping,
            seq_lens: Some(seq_lens.to_vec()),
            seq_lens_tensor: Some(seq_lens_tensor),
            max_query_len: Some(max_query_len),
            max_prefill_seq_len,
            max_decode_seq_len,
            query_start_loc: Some(query_start_loc),
            seq_start_loc: Some(seq_start_loc),
            context_lens_tensor: Some(context_lens_tensor),
            block_tables: Some(block_tables),
            use_cuda_graph: cuda_graph_pad_size.is_some(),
            views: MetadataViews::default(),
        })
    }
}
