//! End-to-end tests of the HiP attention backend on CPU: metadata building,
//! cache writes, dense/sparse routing and mask refresh across decode steps.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use hip_attn_core::attention::hip::{
    AttentionLayerConfig, BuilderContext, GraphBlockTables, HipAttentionBackend,
    HipAttentionImpl, HipAttentionMetadata, HipConfig, LayerAttentionState, MaskRefreshSchedule,
};
use hip_attn_core::attention::ops::sdpa;
use hip_attn_core::attention::{AttentionBackend, AttentionType, NaiveDenseAttention};

use common::*;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

fn scale() -> f32 {
    1.0 / (HEAD_SIZE as f32).sqrt()
}

fn layer(config: Arc<HipConfig>, layer_index: usize, sparse: Arc<ExactSparseKernel>) -> HipAttentionImpl {
    HipAttentionImpl::new(
        AttentionLayerConfig::new(HEADS, KV_HEADS, HEAD_SIZE, layer_index),
        config,
        Arc::new(NaiveDenseAttention::new()),
        sparse,
    )
    .unwrap()
}

fn run(
    hip: &HipAttentionImpl,
    state: &mut LayerAttentionState,
    inputs: &(Tensor, Tensor, Tensor),
    cache: &Tensor,
    meta: &HipAttentionMetadata,
) -> Tensor {
    hip.forward(
        state,
        &inputs.0,
        &inputs.1,
        &inputs.2,
        Some(cache),
        meta,
        1.0,
        1.0,
        AttentionType::Decoder,
    )
    .unwrap()
}

#[test]
fn prefill_then_decode_follows_refresh_schedule() {
    init_tracing();
    let config = Arc::new(
        HipConfig::from_lookup(lookup(&[
            ("HIP_DENSE_LAYERS", "0"),
            ("HIP_SEQ_THRESH", "8"),
            ("HIP_REFRESH_INTERVAL", "2"),
        ]))
        .unwrap(),
    );
    let backend = HipAttentionBackend::new();
    let cache = zeros_cache(backend.kv_cache_shape(8, 16, KV_HEADS, HEAD_SIZE).unwrap());
    let sparse = Arc::new(ExactSparseKernel::default());
    let hip = layer(config.clone(), 1, sparse.clone());
    let mut state = LayerAttentionState::new();
    let schedule = MaskRefreshSchedule::from_config(&config);
    let blocks = vec![3, 5];

    // Prompt of 20 tokens: longer than HIP_SEQ_THRESH, so sparse.
    let prompt_inputs = qkv(20);
    let mut builder = backend.make_metadata_builder(BuilderContext::new(16, Device::Cpu));
    builder.add_seq_group_input(prompt(0, 20, blocks.clone()));
    let meta = builder.build(&[20], &[20], None, 1, None).unwrap();
    let out = run(&hip, &mut state, &prompt_inputs, &cache, &meta);
    assert_eq!(*sparse.prefill_calls.lock().unwrap(), 1);

    let expected = sdpa(
        &heads(&prompt_inputs.0, HEADS),
        &heads(&prompt_inputs.1, KV_HEADS),
        &heads(&prompt_inputs.2, KV_HEADS),
        scale(),
        true,
    )
    .unwrap()
    .reshape((20, HEADS * HEAD_SIZE))
    .unwrap();
    assert!(max_abs_diff(&out, &expected) < 1e-4);

    let mut keys = heads(&prompt_inputs.1, KV_HEADS);
    let mut values = heads(&prompt_inputs.2, KV_HEADS);
    for step in 0..4 {
        schedule.apply(&mut state, step);
        let seq_len = 21 + step;
        let inputs = qkv(1);
        let mut builder = backend.make_metadata_builder(BuilderContext::new(16, Device::Cpu));
        builder.add_seq_group_input(decode(0, seq_len, blocks.clone()));
        let meta = builder.build(&[seq_len], &[1], None, 1, None).unwrap();
        let out = run(&hip, &mut state, &inputs, &cache, &meta);

        keys = Tensor::cat(&[&keys, &heads(&inputs.1, KV_HEADS)], 0).unwrap();
        values = Tensor::cat(&[&values, &heads(&inputs.2, KV_HEADS)], 0).unwrap();
        let expected = sdpa(&heads(&inputs.0, HEADS), &keys, &values, scale(), true)
            .unwrap()
            .reshape((1, HEADS * HEAD_SIZE))
            .unwrap();
        assert!(max_abs_diff(&out, &expected) < 1e-4, "step {step}");
    }

    // Refresh on even steps, reuse on odd ones.
    assert_eq!(
        *sparse.decode_calls.lock().unwrap(),
        vec![false, true, false, true]
    );
}

#[test]
fn chunked_prefill_and_decode_share_one_batch() {
    let config = Arc::new(HipConfig::default());
    let backend = HipAttentionBackend::new();
    let cache = zeros_cache(backend.kv_cache_shape(4, 16, KV_HEADS, HEAD_SIZE).unwrap());
    let sparse = Arc::new(ExactSparseKernel::default());
    // Layer 0 is dense under the default HIP_DENSE_LAYERS.
    let hip = layer(config, 0, sparse.clone());
    let mut state = LayerAttentionState::new();
    let mut ctx = BuilderContext::new(16, Device::Cpu);
    ctx.chunked_prefill_enabled = true;

    // Sequence 1 first gets a 3-token prompt.
    let first = qkv(3);
    let mut builder = backend.make_metadata_builder(ctx.clone());
    builder.add_seq_group_input(prompt(1, 3, vec![2]));
    let meta = builder.build(&[3], &[3], None, 1, None).unwrap();
    run(&hip, &mut state, &first, &cache, &meta);

    // Next step: a 6-token prompt for sequence 0 and one decode token for sequence 1.
    let mixed = qkv(7);
    let mut builder = backend.make_metadata_builder(ctx);
    builder.add_seq_group_input(prompt(0, 6, vec![0]));
    builder.add_seq_group_input(decode(1, 4, vec![2]));
    let meta = builder.build(&[6, 4], &[6, 1], None, 2, None).unwrap();
    assert_eq!(meta.num_prefill_tokens, 6);
    assert_eq!(meta.num_decode_tokens, 1);
    let out = run(&hip, &mut state, &mixed, &cache, &meta);
    assert_eq!(out.dims(), &[7, HEADS * HEAD_SIZE]);
    assert_eq!(*sparse.prefill_calls.lock().unwrap(), 0);
    assert!(sparse.decode_calls.lock().unwrap().is_empty());

    let (q, k, v) = (heads(&mixed.0, HEADS), heads(&mixed.1, KV_HEADS), heads(&mixed.2, KV_HEADS));
    let prefill = sdpa(
        &q.narrow(0, 0, 6).unwrap(),
        &k.narrow(0, 0, 6).unwrap(),
        &v.narrow(0, 0, 6).unwrap(),
        scale(),
        true,
    )
    .unwrap();
    let seq1_keys = Tensor::cat(&[&heads(&first.1, KV_HEADS), &k.narrow(0, 6, 1).unwrap()], 0).unwrap();
    let seq1_values = Tensor::cat(&[&heads(&first.2, KV_HEADS), &v.narrow(0, 6, 1).unwrap()], 0).unwrap();
    let decode_out = sdpa(&q.narrow(0, 6, 1).unwrap(), &seq1_keys, &seq1_values, scale(), true).unwrap();
    let expected = Tensor::cat(&[prefill, decode_out], 0)
        .unwrap()
        .reshape((7, HEADS * HEAD_SIZE))
        .unwrap();
    assert!(max_abs_diff(&out, &expected) < 1e-4);
}

#[test]
fn graph_padded_decode_keeps_real_rows_exact() {
    let config = Arc::new(HipConfig::default());
    let backend = HipAttentionBackend::new();
    let cache = zeros_cache(backend.kv_cache_shape(4, 16, KV_HEADS, HEAD_SIZE).unwrap());
    let hip = layer(config, 0, Arc::new(ExactSparseKernel::default()));
    let mut state = LayerAttentionState::new();

    let prompts = qkv(9);
    let mut builder = backend.make_metadata_builder(BuilderContext::new(16, Device::Cpu));
    builder.add_seq_group_input(prompt(0, 5, vec![1]));
    builder.add_seq_group_input(prompt(1, 4, vec![3]));
    let meta = builder.build(&[5, 4], &[5, 4], None, 2, None).unwrap();
    run(&hip, &mut state, &prompts, &cache, &meta);

    // Two real decode tokens padded to a captured batch of 4.
    let mut graph = GraphBlockTables::from_max_context(8, 64, 16);
    let step = qkv(4);
    let mut builder = backend.make_metadata_builder(BuilderContext::new(16, Device::Cpu));
    builder.add_seq_group_input(decode(0, 6, vec![1]));
    builder.add_seq_group_input(decode(1, 5, vec![3]));
    let meta = builder
        .build(&[6, 5, 1, 1], &[1, 1, 1, 1], Some(2), 4, Some(&mut graph))
        .unwrap();
    assert!(meta.use_cuda_graph);
    assert_eq!(meta.num_decode_tokens, 4);
    assert_eq!(meta.block_tables.as_ref().unwrap().dims(), &[4, 4]);

    let out = run(&hip, &mut state, &step, &cache, &meta);
    assert_eq!(out.dims(), &[4, HEADS * HEAD_SIZE]);

    let (pk, pv) = (heads(&prompts.1, KV_HEADS), heads(&prompts.2, KV_HEADS));
    let (q, k, v) = (heads(&step.0, HEADS), heads(&step.1, KV_HEADS), heads(&step.2, KV_HEADS));
    let seq0 = sdpa(
        &q.narrow(0, 0, 1).unwrap(),
        &Tensor::cat(&[&pk.narrow(0, 0, 5).unwrap(), &k.narrow(0, 0, 1).unwrap()], 0).unwrap(),
        &Tensor::cat(&[&pv.narrow(0, 0, 5).unwrap(), &v.narrow(0, 0, 1).unwrap()], 0).unwrap(),
        scale(),
        true,
    )
    .unwrap();
    let seq1 = sdpa(
        &q.narrow(0, 1, 1).unwrap(),
        &Tensor::cat(&[&pk.narrow(0, 5, 4).unwrap(), &k.narrow(0, 1, 1).unwrap()], 0).unwrap(),
        &Tensor::cat(&[&pv.narrow(0, 5, 4).unwrap(), &v.narrow(0, 1, 1).unwrap()], 0).unwrap(),
        scale(),
        true,
    )
    .unwrap();
    let expected = Tensor::cat(&[seq0, seq1], 0)
        .unwrap()
        .reshape((2, HEADS * HEAD_SIZE))
        .unwrap();
    assert!(max_abs_diff(&out.narrow(0, 0, 2).unwrap(), &expected) < 1e-4);
}

#[test]
fn profiling_run_without_cache_writes_nothing() {
    let config = Arc::new(HipConfig::default());
    let hip = layer(config, 0, Arc::new(ExactSparseKernel::default()));
    let backend = HipAttentionBackend::new();
    let mut group = prompt(0, 8, vec![]);
    group.block_tables = None;
    let mut builder = backend.make_metadata_builder(BuilderContext::new(16, Device::Cpu));
    builder.add_seq_group_input(group);
    let meta = builder.build(&[8], &[8], None, 1, None).unwrap();

    let inputs = qkv(8);
    let out = hip
        .forward(
            &mut LayerAttentionState::new(),
            &inputs.0,
            &inputs.1,
            &inputs.2,
            None,
            &meta,
            1.0,
            1.0,
            AttentionType::Decoder,
        )
        .unwrap();
    assert_eq!(out.dims(), &[8, HEADS * HEAD_SIZE]);
}
