use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("kv cache must have shape [2, num_blocks, block_size, num_kv_heads, head_size], got {0:?}")]
    InvalidShape(Vec<usize>),

    #[error("kv cache tensor must be contiguous for in-place updates")]
    NotContiguous,

    #[error("block {block_id} is out of range for a cache of {num_blocks} blocks")]
    BlockOutOfRange { block_id: usize, num_blocks: usize },

    #[error("slot {slot} is out of range for a cache of {num_slots} slots")]
    SlotOutOfRange { slot: i64, num_slots: usize },

    #[error("slot mapping has {slots} entries but {tokens} tokens were given")]
    SlotCountMismatch { slots: usize, tokens: usize },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
