//! Host-side helpers shared by attention metadata builders.

use std::collections::HashMap;

use candle_core::{Device, Tensor, WithDType};

use super::error::{HipAttentionError, Result};
use crate::kv_cache::{BlockId, SeqId};

/// Slot index written for tokens that must not touch the KV cache.
pub const PAD_SLOT_ID: i64 = -1;

/// Per-sequence block tables for one sequence group. `None` during the memory
/// profiling run, when no blocks have been allocated yet.
pub type SeqBlockTables = Option<HashMap<SeqId, Vec<BlockId>>>;

pub fn is_block_tables_empty(block_tables: &SeqBlockTables) -> bool {
    match block_tables {
        None => true,
        Some(tables) => tables.is_empty(),
    }
}

/// First token position of a sequence that gets a real cache slot.
///
/// Prompts under a sliding window only cache the trailing `sliding_window`
/// tokens; the positions before that are mapped to [`PAD_SLOT_ID`].
pub fn compute_slot_mapping_start_idx(
    is_prompt: bool,
    query_len: usize,
    context_len: usize,
    sliding_window: Option<usize>,
    use_v2_block_manager: bool,
) -> Result<usize> {
    match sliding_window {
        Some(window) if is_prompt => {
            if !use_v2_block_manager && context_len != 0 {
                return Err(HipAttentionError::SlidingWindowWithContext { context_len });
            }
            Ok(query_len.saturating_sub(window))
        }
        _ => Ok(0),
    }
}

/// Append the cache slots for tokens `[context_len, seq_len)` of one sequence.
#[allow(clippy::too_many_arguments)]
pub fn compute_slot_mapping(
    is_profile_run: bool,
    slot_mapping: &mut Vec<i64>,
    seq_id: SeqId,
    seq_len: usize,
    context_len: usize,
    start_idx: usize,
    block_size: usize,
    block_tables: &SeqBlockTables,
) -> Result<()> {
    if is_profile_run {
        slot_mapping.extend(std::iter::repeat_n(PAD_SLOT_ID, seq_len));
        return Ok(());
    }

    let padding_len = start_idx.saturating_sub(context_len);
    slot_mapping.extend(std::iter::repeat_n(PAD_SLOT_ID, padding_len));

    let block_table = block_tables
        .as_ref()
        .and_then(|tables| tables.get(&seq_id))
        .ok_or(HipAttentionError::MissingBlockTable { seq_id })?;

    let range_start = start_idx.max(context_len);
    for i in range_start..seq_len {
        let block_number = *block_table
            .get(i / block_size)
            .ok_or(HipAttentionError::MissingBlockTable { seq_id })?;
        slot_mapping.push((block_number * block_size + i % block_size) as i64);
    }
    Ok(())
}

/// `[0, l0, l0 + l1, ...]`, length `lens.len() + 1`.
pub fn exclusive_prefix_sum(lens: &[usize]) -> Vec<u32> {
    let mut out = Vec::with_capacity(lens.len() + 1);
    let mut acc = 0u32;
    out.push(acc);
    for &len in lens {
        acc += len as u32;
        out.push(acc);
    }
    out
}

/// Stage host data in a CPU tensor and move it to `device`.
///
/// The copy is ordered on the device stream, so the host does not wait for it.
pub fn async_tensor_h2d<T: WithDType>(data: &[T], device: &Device) -> Result<Tensor> {
    let host = Tensor::from_slice(data, data.len(), &Device::Cpu)?;
    Ok(host.to_device(device)?)
}

/// Right-pad ragged rows with `pad` into a `[rows.len(), max_len]` U32 tensor.
pub fn make_tensor_with_pad(rows: &[Vec<BlockId>], pad: u32, device: &Device) -> Result<Tensor> {
    let max_len = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut data = Vec::with_capacity(rows.len() * max_len);
    for row in rows {
        data.extend(row.iter().map(|&b| b as u32));
        data.extend(std::iter::repeat_n(pad, max_len - row.len()));
    }
    let host = Tensor::from_vec(data, (rows.len(), max_len), &Device::Cpu)?;
    Ok(host.to_device(device)?)
}
