//! Common attention operations shared across kernels.

use candle_core::{DType, Device, Result, Tensor};

/// Repeat KV heads for Grouped Query Attention.
///
/// # Arguments
/// * `x` - Input tensor `[batch, num_kv_heads, seq_len, head_dim]`
/// * `num_kv_groups` - Number of times to repeat each KV head (num_heads / num_kv_heads)
///
/// # Returns
/// Tensor with shape `[batch, num_heads, seq_len, head_dim]`
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    let num_heads = num_kv_heads * num_kv_groups;
    x.unsqueeze(2)?
        .expand((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_heads, s, d))
}

/// Additive causal mask `[q_len, kv_len]` aligned to the bottom-right corner:
/// query `i` sees keys `0..=i + (kv_len - q_len)`.
pub fn causal_mask(q_len: usize, kv_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let offset = kv_len.saturating_sub(q_len);
    let mask: Vec<f32> = (0..q_len)
        .flat_map(|i| {
            (0..kv_len).map(move |j| {
                if j > i + offset {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (q_len, kv_len), device)?.to_dtype(dtype)
}

/// Scaled dot-product attention for one sequence.
///
/// `q` is `[q_len, num_heads, head_dim]`, `k`/`v` are
/// `[kv_len, num_kv_heads, head_dim]`. Returns `[q_len, num_heads, head_dim]`.
pub fn sdpa(q: &Tensor, k: &Tensor, v: &Tensor, scale: f32, causal: bool) -> Result<Tensor> {
    let (q_len, num_heads, head_dim) = q.dims3()?;
    let (kv_len, num_kv_heads, _) = k.dims3()?;
    if q_len == 0 || kv_len == 0 {
        return Tensor::zeros((q_len, num_heads, head_dim), q.dtype(), q.device());
    }

    let num_kv_groups = num_heads / num_kv_heads;
    let q = q.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;
    let k = repeat_kv(k.transpose(0, 1)?.unsqueeze(0)?.contiguous()?, num_kv_groups)?;
    let v = repeat_kv(v.transpose(0, 1)?.unsqueeze(0)?.contiguous()?, num_kv_groups)?;

    let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale as f64)?;
    let attn_weights = if causal {
        attn_weights.broadcast_add(&causal_mask(q_len, kv_len, attn_weights.dtype(), q.device())?)?
    } else {
        attn_weights
    };
    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
    let attn_output = attn_weights.matmul(&v.contiguous()?)?;

    // [1, num_heads, q_len, head_dim] -> [q_len, num_heads, head_dim]
    attn_output.squeeze(0)?.transpose(0, 1)?.contiguous()
}
