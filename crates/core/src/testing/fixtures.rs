use std::collections::HashMap;

use crate::attention::hip::{AttentionLayerConfig, SeqGroupInput};
use crate::kv_cache::{BlockId, SeqId};

/// Prompt of `len` fresh tokens stored in `blocks`.
pub fn prompt_group(seq_id: SeqId, len: usize, blocks: Vec<BlockId>) -> SeqGroupInput {
    SeqGroupInput {
        seq_ids: vec![seq_id],
        input_token_lens: vec![len],
        orig_seq_lens: vec![len],
        seq_lens: vec![len],
        query_lens: vec![len],
        context_lens: vec![0],
        curr_sliding_window_blocks: vec![0],
        block_tables: Some(HashMap::from([(seq_id, blocks)])),
        is_prompt: true,
        prefix_cache_hit: false,
    }
}

/// One decode token of a sequence that is `seq_len` tokens long after this step.
pub fn decode_group(seq_id: SeqId, seq_len: usize, blocks: Vec<BlockId>) -> SeqGroupInput {
    SeqGroupInput {
        seq_ids: vec![seq_id],
        input_token_lens: vec![1],
        orig_seq_lens: vec![seq_len],
        seq_lens: vec![seq_len],
        query_lens: vec![1],
        context_lens: vec![seq_len - 1],
        curr_sliding_window_blocks: vec![0],
        block_tables: Some(HashMap::from([(seq_id, blocks)])),
        is_prompt: false,
        prefix_cache_hit: false,
    }
}

/// 4 query heads over 2 KV heads of size 16.
pub fn tiny_layer(layer_index: usize) -> AttentionLayerConfig {
    AttentionLayerConfig::new(4, 2, 16, layer_index)
}
