//! HiP (hierarchical pruning) attention backend.
//!
//! Long prompts and decode steps are routed to sparse HiP kernels; short
//! prompts, configured dense layers and forced-dense decode run exact
//! attention. The backend owns no weights: it builds per-step metadata,
//! writes new keys and values into the paged cache and dispatches to the
//! kernels it was constructed with.

mod backend;
mod builder;
mod config;
mod dispatch;
mod metadata;
mod state;

pub use backend::{HipAttentionBackend, BLOCK_SIZE_ALIGNMENT, SUPPORTED_HEAD_SIZES};
pub use builder::{BuilderContext, GraphBlockTables, HipAttentionMetadataBuilder, SeqGroupInput};
pub use config::{
    parse_dense_layers, ConfigError, DenseLayers, HipAttentionParams, HipConfig, SampleMethod,
};
pub use dispatch::{
    select_decode_path, select_prefill_path, AttentionLayerConfig, AttentionPath,
    HipAttentionImpl, HipAttentionLayer,
};
pub use metadata::{HipAttentionMetadata, MetadataViews};
pub use state::{LayerAttentionState, MaskCache, MaskRefreshSchedule, QueryPrefix};
