use thiserror::Error;

use super::backend::AttentionType;
use crate::kv_cache::{CacheError, SeqId};

#[derive(Error, Debug)]
pub enum HipAttentionError {
    #[error("{0} is not supported by HiP attention")]
    UnsupportedFeature(&'static str),

    #[error("head size {head_size} is not supported by HiP attention, supported head sizes are: {supported:?}")]
    UnsupportedHeadSize {
        head_size: usize,
        supported: &'static [usize],
    },

    #[error("block size must be a multiple of 16, got {0}")]
    InvalidBlockSize(usize),

    #[error("{0:?} attention is not implemented for HiP attention")]
    NotImplemented(AttentionType),

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("max query length must be positive, query_lens: {0:?}")]
    InvalidQueryLens(Vec<usize>),

    #[error("decode sequence must have query length 1: seq_len {seq_len}, context_len {context_len}, query_len {query_len}")]
    InvalidDecodeQueryLen {
        seq_len: usize,
        context_len: usize,
        query_len: usize,
    },

    #[error("no block table for sequence {seq_id}")]
    MissingBlockTable { seq_id: SeqId },

    #[error("metadata field `{0}` is required here but was not set")]
    MissingMetadata(&'static str),

    #[error("decode attention requires a KV cache")]
    MissingKvCache,

    #[error("cuda graph padding requested without a graph block table buffer")]
    GraphBufferMissing,

    #[error("graph block table buffer is {capacity_rows}x{capacity_blocks}, cannot hold {rows} rows of up to {blocks} blocks")]
    GraphBufferOverflow {
        capacity_rows: usize,
        capacity_blocks: usize,
        rows: usize,
        blocks: usize,
    },

    #[error("sliding window requires the v2 block manager when context_len is {context_len}")]
    SlidingWindowWithContext { context_len: usize },

    #[error("invalid query prefix: {0}")]
    InvalidQueryPrefix(String),

    #[error("kv cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, HipAttentionError>;
