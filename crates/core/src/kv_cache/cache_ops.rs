//! In-place block operations on a two-plane paged KV cache.
//!
//! Cache layout: `[2, num_blocks, block_size, num_kv_heads, head_size]`, plane 0
//! holds keys and plane 1 holds values. Because the tensor is contiguous, it can
//! be viewed (without copying) as `[2 * num_blocks, block_elems]` for block-level
//! moves or as `[2 * num_slots, num_kv_heads * head_size]` for per-token writes,
//! and `scatter_set` updates the shared storage directly.

use candle_core::{Device, Tensor};

use super::error::CacheError;
use super::BlockId;

/// A validated view over an externally owned KV cache tensor.
#[derive(Debug, Clone, Copy)]
pub struct PagedKvCache<'a> {
    tensor: &'a Tensor,
    num_blocks: usize,
    block_size: usize,
    num_kv_heads: usize,
    head_size: usize,
}

impl<'a> PagedKvCache<'a> {
    pub fn new(tensor: &'a Tensor) -> Result<Self, CacheError> {
        let dims = tensor.dims();
        if dims.len() != 5 || dims[0] != 2 {
            return Err(CacheError::InvalidShape(dims.to_vec()));
        }
        if !tensor.is_contiguous() {
            return Err(CacheError::NotContiguous);
        }
        Ok(Self {
            tensor,
            num_blocks: dims[1],
            block_size: dims[2],
            num_kv_heads: dims[3],
            head_size: dims[4],
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn num_slots(&self) -> usize {
        self.num_blocks * self.block_size
    }

    /// Key plane `[num_blocks, block_size, num_kv_heads, head_size]` (view).
    pub fn key_cache(&self) -> Result<Tensor, CacheError> {
        Ok(self.tensor.get(0)?)
    }

    /// Value plane `[num_blocks, block_size, num_kv_heads, head_size]` (view).
    pub fn value_cache(&self) -> Result<Tensor, CacheError> {
        Ok(self.tensor.get(1)?)
    }

    fn block_elems(&self) -> usize {
        self.block_size * self.num_kv_heads * self.head_size
    }

    fn check_block(&self, block_id: BlockId) -> Result<(), CacheError> {
        if block_id >= self.num_blocks {
            return Err(CacheError::BlockOutOfRange {
                block_id,
                num_blocks: self.num_blocks,
            });
        }
        Ok(())
    }

    /// Write per-token keys/values `[num_tokens, num_kv_heads, head_size]` into
    /// the slots named by `slot_mapping`. Negative slots (padding) are skipped.
    pub fn reshape_and_cache(
        &self,
        key: &Tensor,
        value: &Tensor,
        slot_mapping: &Tensor,
    ) -> Result<(), CacheError> {
        let slots: Vec<i64> = slot_mapping.flatten_all()?.to_vec1()?;
        let num_tokens = key.dim(0)?;
        if slots.len() != num_tokens || value.dim(0)? != num_tokens {
            return Err(CacheError::SlotCountMismatch {
                slots: slots.len(),
                tokens: num_tokens,
            });
        }

        let num_slots = self.num_slots();
        let mut token_idx = Vec::with_capacity(num_tokens);
        let mut rows = Vec::with_capacity(2 * num_tokens);
        for (token, &slot) in slots.iter().enumerate() {
            if slot < 0 {
                continue;
            }
            if slot as usize >= num_slots {
                return Err(CacheError::SlotOutOfRange { slot, num_slots });
            }
            token_idx.push(token as u32);
            rows.push(slot as u32);
        }
        if token_idx.is_empty() {
            return Ok(());
        }
        // Value rows live one full plane after the key rows.
        let value_rows: Vec<u32> = rows.iter().map(|&r| r + num_slots as u32).collect();
        rows.extend(value_rows);

        let n = token_idx.len();
        let row_width = self.num_kv_heads * self.head_size;
        let device = self.tensor.device();
        let token_idx = Tensor::from_vec(token_idx, (n,), key.device())?;
        let k_sel = key.index_select(&token_idx, 0)?.reshape((n, row_width))?;
        let v_sel = value.index_select(&token_idx, 0)?.reshape((n, row_width))?;
        let src = Tensor::cat(&[k_sel, v_sel], 0)?
            .to_dtype(self.tensor.dtype())?
            .to_device(device)?
            .contiguous()?;

        let indices = Tensor::from_vec(rows, (2 * n, 1), device)?
            .broadcast_as((2 * n, row_width))?
            .contiguous()?;
        let flat = self.tensor.reshape((2 * num_slots, row_width))?;
        flat.scatter_set(&indices, &src, 0)?;
        Ok(())
    }

    /// Row indices of `blocks` in the `[2 * num_blocks, block_elems]` view,
    /// keys first, then values.
    fn block_rows(&self, blocks: &[BlockId]) -> Result<Vec<u32>, CacheError> {
        let mut rows = Vec::with_capacity(2 * blocks.len());
        for plane in 0..2 {
            for &block in blocks {
                self.check_block(block)?;
                rows.push((plane * self.num_blocks + block) as u32);
            }
        }
        Ok(rows)
    }

    fn flat_blocks(&self) -> Result<Tensor, CacheError> {
        Ok(self
            .tensor
            .reshape((2 * self.num_blocks, self.block_elems()))?)
    }

    fn read_blocks(&self, blocks: &[BlockId]) -> Result<Tensor, CacheError> {
        let rows = self.block_rows(blocks)?;
        let idx = Tensor::from_vec(rows, (2 * blocks.len(),), self.tensor.device())?;
        Ok(self.flat_blocks()?.index_select(&idx, 0)?)
    }

    fn write_blocks(&self, blocks: &[BlockId], src: &Tensor) -> Result<(), CacheError> {
        let rows = self.block_rows(blocks)?;
        let width = self.block_elems();
        let src = src
            .to_device(self.tensor.device())?
            .to_dtype(self.tensor.dtype())?
            .contiguous()?;
        let idx = Tensor::from_vec(rows, (2 * blocks.len(), 1), self.tensor.device())?
            .broadcast_as((2 * blocks.len(), width))?
            .contiguous()?;
        self.flat_blocks()?.scatter_set(&idx, &src, 0)?;
        Ok(())
    }
}

/// Move blocks between two caches (typically device <-> host), applying the
/// same mapping to the key and value planes.
pub fn swap_blocks(
    src_kv_cache: &Tensor,
    dst_kv_cache: &Tensor,
    src_to_dst: &[(BlockId, BlockId)],
) -> Result<(), CacheError> {
    if src_to_dst.is_empty() {
        return Ok(());
    }
    let src = PagedKvCache::new(src_kv_cache)?;
    let dst = PagedKvCache::new(dst_kv_cache)?;
    if src.block_elems() != dst.block_elems() {
        return Err(CacheError::InvalidShape(dst_kv_cache.dims().to_vec()));
    }
    let (src_blocks, dst_blocks): (Vec<_>, Vec<_>) = src_to_dst.iter().copied().unzip();
    let data = src.read_blocks(&src_blocks)?;
    dst.write_blocks(&dst_blocks, &data)
}

/// Copy blocks within each cache, applying the same mapping to every cache
/// (one per layer) and to both planes.
pub fn copy_blocks(
    kv_caches: &[Tensor],
    src_to_dsts: &[(BlockId, BlockId)],
) -> Result<(), CacheError> {
    if src_to_dsts.is_empty() {
        return Ok(());
    }
    let (src_blocks, dst_blocks): (Vec<_>, Vec<_>) = src_to_dsts.iter().copied().unzip();
    for kv_cache in kv_caches {
        let cache = PagedKvCache::new(kv_cache)?;
        // index_select materializes the sources before any destination is written.
        let data = cache.read_blocks(&src_blocks)?;
        cache.write_blocks(&dst_blocks, &data)?;
    }
    Ok(())
}

/// Gather the first `num_tokens` tokens addressed by `block_ids` from one cache
/// plane `[num_blocks, block_size, num_kv_heads, head_size]`.
///
/// Returns `[num_tokens, num_kv_heads, head_size]`.
pub fn gather_paged(
    cache_plane: &Tensor,
    block_ids: &[u32],
    num_tokens: usize,
) -> Result<Tensor, CacheError> {
    let (num_blocks, block_size, num_kv_heads, head_size) = cache_plane.dims4()?;
    let needed = num_tokens.div_ceil(block_size);
    if needed > block_ids.len() {
        return Err(CacheError::BlockOutOfRange {
            block_id: needed,
            num_blocks: block_ids.len(),
        });
    }
    if let Some(&bad) = block_ids[..needed]
        .iter()
        .find(|&&b| b as usize >= num_blocks)
    {
        return Err(CacheError::BlockOutOfRange {
            block_id: bad as usize,
            num_blocks,
        });
    }
    if num_tokens == 0 {
        return Ok(Tensor::zeros(
            (0, num_kv_heads, head_size),
            cache_plane.dtype(),
            cache_plane.device(),
        )?);
    }
    let idx = Tensor::from_vec(
        block_ids[..needed].to_vec(),
        (needed,),
        cache_plane.device(),
    )?;
    let blocks = cache_plane.index_select(&idx, 0)?;
    Ok(blocks
        .reshape((needed * block_size, num_kv_heads, head_size))?
        .narrow(0, 0, num_tokens)?)
}

/// Allocate a zeroed cache of the given shape on `device`.
pub fn allocate_kv_cache(
    shape: [usize; 5],
    dtype: candle_core::DType,
    device: &Device,
) -> Result<Tensor, CacheError> {
    Ok(Tensor::zeros(shape.to_vec(), dtype, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn cache(num_blocks: usize, block_size: usize) -> Tensor {
        allocate_kv_cache([2, num_blocks, block_size, 2, 4], DType::F32, &Device::Cpu).unwrap()
    }

    fn token_data(num_tokens: usize, base: f32) -> Tensor {
        let data: Vec<f32> = (0..num_tokens * 8).map(|i| base + i as f32).collect();
        Tensor::from_vec(data, (num_tokens, 2, 4), &Device::Cpu).unwrap()
    }

    fn slots(values: &[i64]) -> Tensor {
        Tensor::from_vec(values.to_vec(), (values.len(),), &Device::Cpu).unwrap()
    }

    #[test]
    fn rejects_wrong_rank() {
        let t = Tensor::zeros((4, 16, 2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            PagedKvCache::new(&t),
            Err(CacheError::InvalidShape(_))
        ));
    }

    #[test]
    fn write_then_gather_roundtrip() {
        let kv = cache(4, 16);
        let cache = PagedKvCache::new(&kv).unwrap();
        let k = token_data(3, 0.0);
        let v = token_data(3, 100.0);
        // Tokens go to block 2, offsets 0..3
        cache
            .reshape_and_cache(&k, &v, &slots(&[32, 33, 34]))
            .unwrap();

        let k_read = gather_paged(&cache.key_cache().unwrap(), &[2], 3).unwrap();
        let v_read = gather_paged(&cache.value_cache().unwrap(), &[2], 3).unwrap();
        assert_eq!(
            k_read.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            k.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
        assert_eq!(
            v_read.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            v.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn padding_slots_are_skipped() {
        let kv = cache(2, 16);
        let cache = PagedKvCache::new(&kv).unwrap();
        let k = token_data(2, 1.0);
        let v = token_data(2, 1.0);
        cache.reshape_and_cache(&k, &v, &slots(&[-1, 5])).unwrap();

        let keys = gather_paged(&cache.key_cache().unwrap(), &[0], 16).unwrap();
        let row0: Vec<f32> = keys.get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(row0.iter().all(|&x| x == 0.0));
        let row5: Vec<f32> = keys.get(5).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(row5[0], 9.0);
    }

    #[test]
    fn slot_out_of_range_fails() {
        let kv = cache(1, 16);
        let cache = PagedKvCache::new(&kv).unwrap();
        let k = token_data(1, 0.0);
        let err = cache.reshape_and_cache(&k, &k, &slots(&[16])).unwrap_err();
        assert!(matches!(err, CacheError::SlotOutOfRange { slot: 16, .. }));
    }

    #[test]
    fn copy_blocks_applies_to_both_planes() {
        let kv = cache(3, 16);
        let k = token_data(16, 0.0);
        let v = token_data(16, 500.0);
        let block0: Vec<i64> = (0..16).collect();
        PagedKvCache::new(&kv)
            .unwrap()
            .reshape_and_cache(&k, &v, &slots(&block0))
            .unwrap();

        copy_blocks(std::slice::from_ref(&kv), &[(0, 2)]).unwrap();

        let cache = PagedKvCache::new(&kv).unwrap();
        let k2 = gather_paged(&cache.key_cache().unwrap(), &[2], 16).unwrap();
        let v2 = gather_paged(&cache.value_cache().unwrap(), &[2], 16).unwrap();
        assert_eq!(
            k2.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            k.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
        assert_eq!(
            v2.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            v.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn swap_blocks_moves_between_caches() {
        let src = cache(2, 16);
        let dst = cache(4, 16);
        let k = token_data(16, 7.0);
        let block1: Vec<i64> = (16..32).collect();
        PagedKvCache::new(&src)
            .unwrap()
            .reshape_and_cache(&k, &k, &slots(&block1))
            .unwrap();

        swap_blocks(&src, &dst, &[(1, 3)]).unwrap();

        let dst_cache = PagedKvCache::new(&dst).unwrap();
        let moved = gather_paged(&dst_cache.key_cache().unwrap(), &[3], 16).unwrap();
        assert_eq!(
            moved.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            k.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
        let untouched = gather_paged(&dst_cache.key_cache().unwrap(), &[1], 16).unwrap();
        let sum: f32 = untouched.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }

    #[test]
    fn copy_blocks_rejects_out_of_range_block() {
        let kv = cache(2, 16);
        let err = copy_blocks(std::slice::from_ref(&kv), &[(0, 5)]).unwrap_err();
        assert!(matches!(
            err,
            CacheError::BlockOutOfRange {
                block_id: 5,
                num_blocks: 2
            }
        ));
    }

    #[test]
    fn gather_spans_multiple_blocks() {
        let kv = cache(4, 16);
        let cache = PagedKvCache::new(&kv).unwrap();
        let k = token_data(20, 0.0);
        // First 16 tokens in block 3, remaining 4 in block 1
        let mut s: Vec<i64> = (48..64).collect();
        s.extend(16..20);
        cache.reshape_and_cache(&k, &k, &slots(&s)).unwrap();

        let read = gather_paged(&cache.key_cache().unwrap(), &[3, 1], 20).unwrap();
        assert_eq!(read.dims(), &[20, 2, 4]);
        assert_eq!(
            read.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            k.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }
}
