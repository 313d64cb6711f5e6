use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use candle_core::{Device, Tensor};

use crate::attention::error::Result;
use crate::attention::hip::HipAttentionParams;
use crate::attention::kernels::{MaskMetadata, PagedKvArgs, SparseAttentionKernel};

/// One recorded call into [`MockSparseKernel`].
#[derive(Debug, Clone, PartialEq)]
pub enum SparseCall {
    Varlen {
        seq_lens: Vec<usize>,
        mask_k: usize,
    },
    PagedVarlen {
        seq_lens: Vec<usize>,
        mask_k: usize,
    },
    Paged {
        q_dims: Vec<usize>,
        mask_k: usize,
        /// Tag of the mask passed back in, if any.
        previous_mask: Option<u32>,
        /// Tag of the mask this call returned.
        returned_mask: u32,
    },
}

/// A sparse kernel that returns zeros of the right shape and records every
/// call. Each decode call returns a mask tagged with a fresh counter value.
#[derive(Debug, Default)]
pub struct MockSparseKernel {
    calls: Mutex<Vec<SparseCall>>,
    next_tag: AtomicU32,
}

impl MockSparseKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SparseCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn mask_tag(mask: &MaskMetadata) -> Option<u32> {
        let indices = mask.indices.as_ref()?;
        indices.to_vec1::<u32>().ok()?.first().copied()
    }

    fn record(&self, call: SparseCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl SparseAttentionKernel for MockSparseKernel {
    fn name(&self) -> &'static str {
        "mock-sparse"
    }

    fn varlen(
        &self,
        q: &Tensor,
        _k: &Tensor,
        _v: &Tensor,
        seq_lens: &[usize],
        _softmax_scale: f32,
        params: &HipAttentionParams,
    ) -> Result<Tensor> {
        self.record(SparseCall::Varlen {
            seq_lens: seq_lens.to_vec(),
            mask_k: params.mask_k,
        });
        Ok(q.zeros_like()?)
    }

    fn paged_varlen(
        &self,
        q: &Tensor,
        seq_lens: &[usize],
        _softmax_scale: f32,
        _cache: &PagedKvArgs<'_>,
        params: &HipAttentionParams,
    ) -> Result<Tensor> {
        self.record(SparseCall::PagedVarlen {
            seq_lens: seq_lens.to_vec(),
            mask_k: params.mask_k,
        });
        Ok(q.zeros_like()?)
    }

    fn paged(
        &self,
        q: &Tensor,
        _softmax_scale: f32,
        _cache: &PagedKvArgs<'_>,
        params: &HipAttentionParams,
        previous_mask: Option<&MaskMetadata>,
    ) -> Result<(Tensor, MaskMetadata)> {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        self.record(SparseCall::Paged {
            q_dims: q.dims().to_vec(),
            mask_k: params.mask_k,
            previous_mask: previous_mask.and_then(Self::mask_tag),
            returned_mask: tag,
        });
        let mask = MaskMetadata {
            indices: Some(Tensor::new(&[tag], &Device::Cpu)?),
            ..Default::default()
        };
        Ok((q.zeros_like()?, mask))
    }
}
