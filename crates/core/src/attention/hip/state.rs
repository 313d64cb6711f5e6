//! Per-layer mutable state of the sparse decode path.

use candle_core::Tensor;

use super::config::HipConfig;
use crate::attention::error::{HipAttentionError, Result};
use crate::attention::kernels::MaskMetadata;

/// Sparse mask retained between decode steps.
#[derive(Debug, Clone, Default)]
pub enum MaskCache {
    #[default]
    Empty,
    Cached(MaskMetadata),
}

impl MaskCache {
    pub fn get(&self) -> Option<&MaskMetadata> {
        match self {
            Self::Empty => None,
            Self::Cached(mask) => Some(mask),
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }

    pub fn reset(&mut self) {
        *self = Self::Empty;
    }

    pub fn store(&mut self, mask: MaskMetadata) {
        *self = Self::Cached(mask);
    }
}

/// Learned queries placed ahead of each decode query.
///
/// The kernel sees `prefixed * alpha + repeated * (1 - alpha)`, where
/// `prefixed` is `[prefix_queries; query]` and `repeated` is the query
/// broadcast over every position.
#[derive(Debug, Clone)]
pub struct QueryPrefix {
    /// `[batch, prefix_len, num_heads, head_size]`
    pub prefix_queries: Tensor,
    /// Broadcastable to `[batch, prefix_len + 1, num_heads, head_size]`.
    pub prefix_query_alpha: Tensor,
}

impl QueryPrefix {
    pub fn prefix_len(&self) -> Result<usize> {
        Ok(self.prefix_queries.dims4()?.1)
    }

    /// Check both tensors against the decode query `[batch, 1, heads, head_size]`.
    pub fn validate(&self, query: &Tensor) -> Result<()> {
        let (batch, _, num_heads, head_size) = query.dims4()?;
        let dims = self.prefix_queries.dims();
        if dims.len() != 4 || dims[0] != batch || dims[2] != num_heads || dims[3] != head_size {
            return Err(HipAttentionError::InvalidQueryPrefix(format!(
                "prefix_queries has shape {dims:?}, expected [{batch}, _, {num_heads}, {head_size}]"
            )));
        }

        let blended = [batch, dims[1] + 1, num_heads, head_size];
        let alpha = self.prefix_query_alpha.dims();
        let broadcastable = alpha.len() <= blended.len()
            && alpha
                .iter()
                .rev()
                .zip(blended.iter().rev())
                .all(|(&a, &b)| a == 1 || a == b);
        if !broadcastable {
            return Err(HipAttentionError::InvalidQueryPrefix(format!(
                "prefix_query_alpha has shape {alpha:?}, not broadcastable to {blended:?}"
            )));
        }
        Ok(())
    }

    /// Returns the blended `[batch, prefix_len + 1, heads, head_size]` query.
    pub fn blend(&self, query: &Tensor) -> Result<Tensor> {
        self.validate(query)?;
        let (batch, _, num_heads, head_size) = query.dims4()?;
        let shape = (batch, self.prefix_len()? + 1, num_heads, head_size);

        let prefix = self.prefix_queries.to_dtype(query.dtype())?;
        let prefixed = Tensor::cat(&[&prefix, query], 1)?;
        let repeated = query.broadcast_as(shape)?;
        let alpha = self
            .prefix_query_alpha
            .to_dtype(query.dtype())?
            .broadcast_as(shape)?;
        let one_minus_alpha = alpha.affine(-1.0, 1.0)?;
        Ok(((prefixed * &alpha)? + (repeated * one_minus_alpha)?)?)
    }
}

/// Mutable attention state owned by one layer.
#[derive(Debug, Clone, Default)]
pub struct LayerAttentionState {
    /// Feed the cached mask back into the next sparse decode call.
    pub use_last_mask: bool,
    /// Keep the mask returned by the sparse decode call.
    pub checkout_last_mask_metadata: bool,
    pub mask: MaskCache,
    /// Retain the most recent decode query in `last_query`.
    pub checkout_query: bool,
    pub last_query: Option<Tensor>,
    pub query_prefix: Option<QueryPrefix>,
    /// Route decode through the dense kernel regardless of configuration.
    pub force_dense: bool,
}

impl LayerAttentionState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Drives mask reuse from `HIP_REFRESH_INTERVAL`.
///
/// At decode step `s` the mask is recomputed when `s % interval == 0` and
/// reused otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskRefreshSchedule {
    interval: usize,
}

impl MaskRefreshSchedule {
    pub fn new(interval: usize) -> Self {
        Self { interval }
    }

    pub fn from_config(config: &HipConfig) -> Self {
        Self::new(config.refresh_interval)
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    pub fn is_refresh_step(&self, step: usize) -> bool {
        self.interval <= 1 || step % self.interval == 0
    }

    pub fn apply(&self, state: &mut LayerAttentionState, step: usize) {
        state.use_last_mask = !self.is_refresh_step(step);
        state.checkout_last_mask_metadata = true;
    }
}
