//! Environment-driven configuration for HiP attention.
//!
//! All tunables are read once into a [`HipConfig`] at startup and shared
//! (immutably, behind an `Arc`) by every attention layer. Defaults:
//!
//! | variable | default |
//! |---|---|
//! | `HIP_WARNINGS` | `0` |
//! | `HIP_REFRESH_INTERVAL` | `8` |
//! | `HIP_DENSE_LAYERS` | `0,1,2` |
//! | `HIP_K`, `HIP_BQ`, `HIP_BSQ`, `HIP_BK`, `HIP_BSK` | `512`, `64`, `2`, `2`, `1` |
//! | `HIP_BK_AFTER_MASK` | `-1` |
//! | `HIP_PREFILL_K`, `HIP_PREFILL_BQ`, ... | decode value |
//! | `HIP_PREFILL_ALWAYS_DENSE` | `0` |
//! | `HIP_SW`, `HIP_NSINK` | `256`, `16` |
//! | `HIP_SAMPLE_METHOD` | `center` |
//! | `HIP_SEQ_THRESH` | `-1` |
//! | `HIP_OFFLOAD` | `0` |

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be an integer, got {value:?}")]
    InvalidInteger { name: &'static str, value: String },

    #[error("HIP_DENSE_LAYERS must be a comma-separated list of layer indices, got {value:?}")]
    InvalidLayerList { value: String },

    #[error("unknown HIP_SAMPLE_METHOD {0:?}")]
    UnknownSampleMethod(String),
}

/// How the sparse kernel picks a representative key inside each key block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleMethod {
    First,
    Last,
    Center,
    Random,
}

impl FromStr for SampleMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "center" => Ok(Self::Center),
            "random" => Ok(Self::Random),
            other => Err(ConfigError::UnknownSampleMethod(other.to_string())),
        }
    }
}

impl fmt::Display for SampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::First => "first",
            Self::Last => "last",
            Self::Center => "center",
            Self::Random => "random",
        };
        f.write_str(name)
    }
}

/// Knobs of the hierarchical-pruning mask. One instance per phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HipAttentionParams {
    /// Number of keys each query block keeps after pruning.
    pub mask_k: usize,
    pub block_size_q: usize,
    pub block_stride_q: usize,
    pub block_size_k: usize,
    pub block_stride_k: usize,
    /// `-1` keeps `block_size_k`.
    pub block_size_k_after_masking: i64,
    pub sample_method: SampleMethod,
    pub sliding_window_size: usize,
    pub sink_token_size: usize,
    /// Leading queries that always attend densely; `-1` disables.
    pub num_dense_queries: i64,
}

impl Default for HipAttentionParams {
    fn default() -> Self {
        Self {
            mask_k: 512,
            block_size_q: 64,
            block_stride_q: 2,
            block_size_k: 2,
            block_stride_k: 1,
            block_size_k_after_masking: -1,
            sample_method: SampleMethod::Center,
            sliding_window_size: 256,
            sink_token_size: 16,
            num_dense_queries: -1,
        }
    }
}

/// Parsed `HIP_DENSE_LAYERS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseLayers {
    pub layers: Vec<usize>,
    /// The value was a bare integer `n`, read as `0..n`.
    pub legacy_count: bool,
}

/// Parse a dense-layer list such as `"0,1,2"`.
///
/// A bare integer `n` is the pre-1.1 form and means the first `n` layers; it
/// is accepted with a warning.
pub fn parse_dense_layers(value: &str) -> Result<DenseLayers, ConfigError> {
    if let Ok(count) = value.trim().parse::<i64>() {
        warn!(
            value,
            "HIP_DENSE_LAYERS is a single integer; since HiP 1.1 it is a list of layer \
             indices such as `0,1,2`. Interpreting it as the first {count} layers"
        );
        return Ok(DenseLayers {
            layers: (0..count.max(0) as usize).collect(),
            legacy_count: true,
        });
    }

    let layers = value
        .split(',')
        .map(|item| item.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ConfigError::InvalidLayerList {
            value: value.to_string(),
        })?;
    Ok(DenseLayers {
        layers,
        legacy_count: false,
    })
}

/// Resolved HiP attention configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HipConfig {
    /// Emit a warning every time the sparse path is taken.
    pub show_warnings: bool,
    /// Decode steps between full sparse-mask recomputations.
    pub refresh_interval: usize,
    /// Layers that always run dense attention.
    pub dense_layers: Vec<usize>,
    pub decode: HipAttentionParams,
    pub prefill: HipAttentionParams,
    pub prefill_always_dense: bool,
    /// Prefill batches whose longest sequence is shorter than this run dense.
    pub seq_threshold: i64,
    pub offload: bool,
}

impl Default for HipConfig {
    fn default() -> Self {
        Self {
            show_warnings: false,
            refresh_interval: 8,
            dense_layers: vec![0, 1, 2],
            decode: HipAttentionParams::default(),
            prefill: HipAttentionParams::default(),
            prefill_always_dense: false,
            seq_threshold: -1,
            offload: false,
        }
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn flag(&self, name: &'static str) -> bool {
        (self.lookup)(name).as_deref() == Some("1")
    }

    fn int<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match (self.lookup)(name) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidInteger { name, value }),
        }
    }
}

impl HipConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`, which returns the raw value of
    /// a variable or `None` when unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let dense_layers = match (vars.lookup)("HIP_DENSE_LAYERS") {
            Some(value) => parse_dense_layers(&value)?.layers,
            None => vec![0, 1, 2],
        };

        let sample_method = match (vars.lookup)("HIP_SAMPLE_METHOD") {
            Some(value) => value.trim().parse()?,
            None => SampleMethod::Center,
        };

        let defaults = HipAttentionParams::default();
        let decode = HipAttentionParams {
            mask_k: vars.int("HIP_K", defaults.mask_k)?,
            block_size_q: vars.int("HIP_BQ", defaults.block_size_q)?,
            block_stride_q: vars.int("HIP_BSQ", defaults.block_stride_q)?,
            block_size_k: vars.int("HIP_BK", defaults.block_size_k)?,
            block_stride_k: vars.int("HIP_BSK", defaults.block_stride_k)?,
            block_size_k_after_masking: vars
                .int("HIP_BK_AFTER_MASK", defaults.block_size_k_after_masking)?,
            sample_method,
            sliding_window_size: vars.int("HIP_SW", defaults.sliding_window_size)?,
            sink_token_size: vars.int("HIP_NSINK", defaults.sink_token_size)?,
            num_dense_queries: defaults.num_dense_queries,
        };

        let seq_threshold = vars.int("HIP_SEQ_THRESH", -1i64)?;
        let prefill = HipAttentionParams {
            mask_k: vars.int("HIP_PREFILL_K", decode.mask_k)?,
            block_size_q: vars.int("HIP_PREFILL_BQ", decode.block_size_q)?,
            block_stride_q: vars.int("HIP_PREFILL_BSQ", decode.block_stride_q)?,
            block_size_k: vars.int("HIP_PREFILL_BK", decode.block_size_k)?,
            block_stride_k: vars.int("HIP_PREFILL_BSK", decode.block_stride_k)?,
            num_dense_queries: seq_threshold,
            ..decode.clone()
        };

        let config = Self {
            show_warnings: vars.flag("HIP_WARNINGS"),
            refresh_interval: vars.int("HIP_REFRESH_INTERVAL", 8usize)?,
            dense_layers,
            decode,
            prefill,
            prefill_always_dense: vars.flag("HIP_PREFILL_ALWAYS_DENSE"),
            seq_threshold,
            offload: vars.flag("HIP_OFFLOAD"),
        };
        config.log_resolved();
        Ok(config)
    }

    fn log_resolved(&self) {
        let decode = serde_json::to_string(&self.decode).unwrap_or_default();
        let prefill = serde_json::to_string(&self.prefill).unwrap_or_default();
        info!(
            dense_layers = ?self.dense_layers,
            seq_threshold = self.seq_threshold,
            refresh_interval = self.refresh_interval,
            offload = self.offload,
            %decode,
            %prefill,
            "Resolved HiP attention config"
        );
    }

    pub fn is_dense_layer(&self, layer_index: usize) -> bool {
        self.dense_layers.contains(&layer_index)
    }
}
