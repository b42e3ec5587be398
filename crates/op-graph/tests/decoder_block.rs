// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! A single attention block driven end to end through the graph protocol.

use device::{CpuDevice, Device};
use op_graph::ops::{Add, Attention, Embedding, LayerNorm, MatMul};
use op_graph::weights::write_weight;
use op_graph::{Graph, Ready};
use std::sync::Arc;
use tensor_core::{DType, InputFile, Shape, StreamError};

const N_VOCAB: usize = 11;
const N_EMBD: usize = 8;
const N_HEAD: usize = 2;
const N_CTX: usize = 16;

fn block(device: Arc<dyn Device>, weight_dtype: DType) -> Graph<Ready> {
    let mut g = Graph::new("block", device);
    let ids = g.add_input("ids", DType::I32);
    let k = g.add_shared("k_cache", Shape::matrix(N_CTX, N_EMBD), DType::F32);
    let v = g.add_shared("v_cache", Shape::matrix(N_CTX, N_EMBD), DType::F32);

    let base = g.op_base("embed", vec![ids]);
    let x = g.add_op(Embedding::new(base, N_VOCAB, N_CTX, N_EMBD, weight_dtype));
    let base = g.op_base("ln", vec![x.clone()]);
    let h = g.add_op(LayerNorm::new(base, N_EMBD, LayerNorm::DEFAULT_EPS));
    let base = g.op_base("c_attn", vec![h]);
    let qkv = g.add_op(MatMul::new(base, N_EMBD, 3 * N_EMBD, true, weight_dtype));
    let base = g.op_base("attn", vec![qkv]);
    let a = g.add_op(Attention::new(base, N_HEAD, k, v));
    let base = g.op_base("c_proj", vec![a]);
    let p = g.add_op(MatMul::new(base, N_EMBD, N_EMBD, true, weight_dtype));
    let base = g.op_base("residual", vec![x, p]);
    let r = g.add_op(Add::new(base));
    let base = g.op_base("logits", vec![r]);
    g.add_op(MatMul::new(base, N_EMBD, N_VOCAB, false, weight_dtype));

    g.build(N_CTX)
}

/// Deterministic small values in [-0.5, 0.5).
fn values(seed: u64, n: usize) -> Vec<f32> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 40) as f32 / (1u64 << 24) as f32) - 0.5
        })
        .collect()
}

fn write_weights(graph: &Graph<Ready>) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    let mut seed = 1;
    for op in graph.ops() {
        for w in op.base().weights() {
            let vals = values(seed, w.num_elements());
            seed += 1;
            let bytes: Vec<u8> = match w.dtype() {
                DType::F32 => vals.iter().flat_map(|v| v.to_le_bytes()).collect(),
                DType::F16 => vals
                    .iter()
                    .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
                    .collect(),
                other => panic!("unexpected weight dtype {other}"),
            };
            write_weight(f.as_file_mut(), w.name(), w.dtype(), w.shape().dims(), &bytes).unwrap();
        }
    }
    f
}

fn run(graph: &mut Graph<Ready>, tokens: &[i32], nr_past: usize) -> Vec<f32> {
    graph.reshape(tokens.len());
    graph.input("ids").unwrap().copy_from(tokens);
    graph.execute(nr_past);
    graph.output("logits").unwrap().to_vec::<f32>()
}

fn loaded(threads: usize, file: &tempfile::NamedTempFile, mmap: bool) -> Graph<Ready> {
    let mut g = block(Arc::new(CpuDevice::new(threads)), DType::F32);
    let stream = Arc::new(InputFile::open(file.path(), mmap).unwrap());
    g.load_weights(&stream).unwrap();
    assert!(stream.is_eof().unwrap());
    g
}

#[test]
fn test_incremental_matches_batched() {
    let file = write_weights(&block(Arc::new(CpuDevice::new(1)), DType::F32));
    let prompt = [3, 1, 4, 1, 5];

    let mut batched = loaded(2, &file, false);
    let all = run(&mut batched, &prompt, 0);
    let last_batched = &all[(prompt.len() - 1) * N_VOCAB..];

    let mut step = loaded(2, &file, false);
    let mut last = Vec::new();
    for (i, &t) in prompt.iter().enumerate() {
        last = run(&mut step, &[t], i);
    }

    for (a, b) in last_batched.iter().zip(&last) {
        assert!((a - b).abs() < 1e-4, "{a} vs {b}");
    }
}

#[test]
fn test_thread_count_does_not_change_results() {
    let file = write_weights(&block(Arc::new(CpuDevice::new(1)), DType::F32));
    let prompt = [0, 2, 7, 10];

    let single = run(&mut loaded(1, &file, false), &prompt, 0);
    let multi = run(&mut loaded(4, &file, false), &prompt, 0);
    assert_eq!(single, multi);
}

#[test]
fn test_mapped_weights_match_read_weights() {
    let file = write_weights(&block(Arc::new(CpuDevice::new(1)), DType::F32));
    let prompt = [9, 8, 7];

    let read = run(&mut loaded(2, &file, false), &prompt, 0);
    let mapped = run(&mut loaded(2, &file, true), &prompt, 0);
    assert_eq!(read, mapped);
}

#[test]
fn test_f16_weights_run() {
    let dev: Arc<dyn Device> = Arc::new(CpuDevice::new(2));
    let mut g = block(dev, DType::F16);
    let file = write_weights(&g);
    let stream = Arc::new(InputFile::open(file.path(), false).unwrap());
    g.load_weights(&stream).unwrap();

    let logits = run(&mut g, &[1, 2], 0);
    assert_eq!(logits.len(), 2 * N_VOCAB);
    assert!(logits.iter().all(|v| v.is_finite()));
}

#[test]
fn test_weights_for_another_graph_are_rejected() {
    let file = write_weights(&block(Arc::new(CpuDevice::new(1)), DType::F16));
    let mut g = block(Arc::new(CpuDevice::new(1)), DType::F32);
    let stream = Arc::new(InputFile::open(file.path(), false).unwrap());
    let err = g.load_weights(&stream).unwrap_err();
    assert!(matches!(err, StreamError::WeightMismatch { .. }), "{err}");
}

#[test]
fn test_only_logits_and_cache_survive_a_pass() {
    let file = write_weights(&block(Arc::new(CpuDevice::new(1)), DType::F32));
    let mut g = loaded(2, &file, true);
    run(&mut g, &[1, 2, 3], 0);

    for name in ["embed", "ln", "c_attn", "attn", "c_proj", "residual"] {
        assert!(!g.output(name).unwrap().is_materialized(), "{name} still live");
    }
    assert!(g.output("logits").unwrap().is_materialized());
    assert!(g.shared("k_cache").unwrap().is_materialized());
}
