// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Integration tests: end-to-end generation on synthetic models.
//!
//! Every test writes a small random-weight model with `synthesize`, loads
//! it through the public `Model` API and decodes from it.

use runtime::model_file::synthesize;
use runtime::{HyperParams, Model, ModelConfig, RuntimeError, SamplingConfig, TokenId};
use std::io::Write;
use std::path::{Path, PathBuf};
use tensor_core::{DType, StreamError};

// ── Helpers ────────────────────────────────────────────────────

fn hparams(weight_dtype: DType) -> HyperParams {
    HyperParams {
        n_vocab: 128,
        n_embd: 16,
        n_head: 4,
        n_layer: 2,
        n_ff: 64,
        n_ctx: 32,
        weight_dtype,
        has_scores: true,
    }
}

fn synth(dir: &Path, weight_dtype: DType) -> PathBuf {
    let path = dir.join(format!("tiny-{weight_dtype}.irtm"));
    synthesize(&path, &hparams(weight_dtype), 42).unwrap();
    path
}

fn model(path: &Path, threads: usize, mmap: bool) -> Model {
    let config = ModelConfig {
        nr_thread: Some(threads),
        enable_mmap: mmap,
        ..Default::default()
    };
    let mut m = Model::new(config, "gpt").unwrap();
    m.load(path).unwrap();
    m.init(SamplingConfig::greedy()).unwrap();
    m
}

/// Decodes `n` tokens after `prompt`, returning the token ids.
fn generate(m: &mut Model, prompt: &str, n: usize) -> Vec<TokenId> {
    let mut token = 0;
    m.decode(prompt, &mut token).unwrap();
    let mut out = vec![token];
    for _ in 1..n {
        m.decode_iter(&mut token).unwrap();
        out.push(token);
    }
    out
}

// ── Tests ──────────────────────────────────────────────────────

#[test]
fn test_end_to_end_decode() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F32);
    let mut m = model(&path, 2, true);

    assert_eq!(m.get_remain_token(), 32);
    let prompt_len = m.vocab().unwrap().tokenize("hello").len();
    assert!(prompt_len > 0);
    let tokens = generate(&mut m, "hello", 6);
    assert_eq!(tokens.len(), 6);
    assert!(tokens.iter().all(|&t| (0..128).contains(&t)));
    // The last sampled token has not been evaluated yet.
    assert_eq!(m.get_remain_token(), 32 - prompt_len - 5);

    let summary = m.decode_summary();
    assert!(summary.contains("decode 5 tokens"), "{summary}");
    assert!(m.metrics().peak_memory_bytes > 0);
}

#[test]
fn test_reset_reproduces_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F32);
    let mut m = model(&path, 2, false);

    let first = generate(&mut m, "the cat", 8);
    m.reset_token();
    assert_eq!(m.get_remain_token(), 32);
    let second = generate(&mut m, "the cat", 8);
    assert_eq!(first, second);
}

#[test]
fn test_thread_count_does_not_change_logits() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F32);

    let mut single = model(&path, 1, false);
    let mut multi = model(&path, 4, false);
    let a = generate(&mut single, "abc xyz", 5);
    let b = generate(&mut multi, "abc xyz", 5);
    assert_eq!(a, b);
    assert_eq!(single.last_logits(), multi.last_logits());
}

#[test]
fn test_mmap_matches_buffered_reads() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F32);

    let mut mapped = model(&path, 2, true);
    let mut read = model(&path, 2, false);
    assert_eq!(generate(&mut mapped, "zz", 4), generate(&mut read, "zz", 4));
    // Mapped weights never enter the pool.
    assert!(mapped.metrics().peak_memory_bytes < read.metrics().peak_memory_bytes);
}

#[test]
fn test_prefill_then_decode_matches_single_decode() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F32);

    let mut split = model(&path, 2, false);
    split.prefill("once upon").unwrap();
    let mut t1 = 0;
    split.decode(" a time", &mut t1).unwrap();

    let mut joined = model(&path, 2, false);
    let mut t2 = 0;
    joined.decode("once upon a time", &mut t2).unwrap();

    assert_eq!(split.get_remain_token(), joined.get_remain_token());
    let (a, b) = (split.last_logits().unwrap(), joined.last_logits().unwrap());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-4, "{x} vs {y}");
    }
}

#[test]
fn test_f16_weights() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F16);
    let config = ModelConfig {
        compt_type: DType::F16,
        nr_thread: Some(2),
        ..Default::default()
    };
    let mut m = Model::new(config, "gpt").unwrap();
    m.load(&path).unwrap();
    m.init(SamplingConfig::greedy()).unwrap();
    assert_eq!(generate(&mut m, "hi", 3).len(), 3);
    assert!(m.last_logits().unwrap().iter().all(|v| v.is_finite()));
}

#[test]
fn test_context_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F32);
    let config = ModelConfig {
        nr_thread: Some(1),
        nr_ctx: 4,
        ..Default::default()
    };
    let mut m = Model::new(config, "gpt").unwrap();
    m.load(&path).unwrap();
    m.init(SamplingConfig::greedy()).unwrap();
    assert_eq!(m.get_remain_token(), 4);

    // x, y and z start no pair in a 128-token vocabulary.
    let mut token = 0;
    m.decode("xyz", &mut token).unwrap();
    m.decode_iter(&mut token).unwrap();
    assert_eq!(m.get_remain_token(), 0);
    let err = m.decode_iter(&mut token).unwrap_err();
    assert!(matches!(err, RuntimeError::ContextExhausted { needed: 1, remaining: 0 }));

    let err = m.prefill("abcdefgh").unwrap_err();
    assert!(matches!(err, RuntimeError::ContextExhausted { .. }));
}

#[test]
fn test_sampling_with_seed_is_reproducible() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F32);
    let sampling = SamplingConfig {
        temperature: 1.5,
        top_k: 0,
        top_p: 1.0,
        seed: Some(9),
        ..Default::default()
    };

    let run = || {
        let mut m = model(&path, 2, false);
        m.init(sampling.clone()).unwrap();
        generate(&mut m, "q", 10)
    };
    assert_eq!(run(), run());
}

#[test]
fn test_decode_before_init() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F32);
    let mut m = Model::new(ModelConfig::default(), "gpt").unwrap();
    m.load(&path).unwrap();
    let mut token = 0;
    assert!(matches!(m.decode("a", &mut token), Err(RuntimeError::NotInitialized)));
    // Prefill only needs a loaded model.
    m.prefill("a").unwrap();
}

#[test]
fn test_empty_input_without_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F32);
    let mut m = model(&path, 1, false);
    let mut token = 0;
    assert!(matches!(m.decode("", &mut token), Err(RuntimeError::EmptyInput)));
}

#[test]
fn test_trailing_bytes_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F32);
    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap()
        .write_all(&[0u8; 7])
        .unwrap();

    let mut m = Model::new(ModelConfig::default(), "gpt").unwrap();
    assert!(m.load(&path).is_err());
    assert!(m.hparams().is_none());
}

#[test]
fn test_not_a_model_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.bin");
    std::fs::write(&path, b"definitely not a model").unwrap();
    let mut m = Model::new(ModelConfig::default(), "gpt").unwrap();
    assert!(matches!(m.load(&path), Err(RuntimeError::ModelFormat(_))));
}

#[test]
fn test_metrics_serialize_to_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F32);
    let mut m = model(&path, 1, true);
    generate(&mut m, "ok", 3);

    let json = serde_json::to_value(m.metrics()).unwrap();
    assert_eq!(json["decode_tokens"], 2);
    assert!(json["passes"].as_u64().unwrap() >= 3);
    assert!(json.get("peak_memory_bytes").is_some());
}

#[test]
fn test_header_with_impossible_vocabulary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("huge-vocab.irtm");
    let header = HyperParams {
        n_vocab: u32::MAX as usize,
        ..hparams(DType::F32)
    };
    let mut file = std::fs::File::create(&path).unwrap();
    header.write(&mut file).unwrap();
    drop(file);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 40);

    let mut m = Model::new(ModelConfig::default(), "gpt").unwrap();
    let err = m.load(&path).unwrap_err();
    assert!(
        matches!(err, RuntimeError::Stream(StreamError::Truncated { offset: 40, .. })),
        "{err:?}"
    );
}

#[test]
fn test_token_record_longer_than_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("long-token.irtm");
    let mut file = std::fs::File::create(&path).unwrap();
    hparams(DType::F32).write(&mut file).unwrap();
    file.write_all(&u32::MAX.to_le_bytes()).unwrap();
    file.write_all(&[0u8; 1024]).unwrap();
    drop(file);

    let mut m = Model::new(ModelConfig::default(), "gpt").unwrap();
    let err = m.load(&path).unwrap_err();
    assert!(
        matches!(err, RuntimeError::Stream(StreamError::Truncated { offset: 44, .. })),
        "{err:?}"
    );
}

#[test]
fn test_compute_type_must_match_weights() {
    let dir = tempfile::tempdir().unwrap();
    let f16 = synth(dir.path(), DType::F16);
    let f32 = synth(dir.path(), DType::F32);

    let mut m = Model::new(ModelConfig::default(), "gpt").unwrap();
    assert!(matches!(m.load(&f16), Err(RuntimeError::ConfigError(_))));
    assert!(m.hparams().is_none());

    let config = ModelConfig {
        compt_type: DType::F16,
        ..Default::default()
    };
    let mut m = Model::new(config, "gpt").unwrap();
    assert!(matches!(m.load(&f32), Err(RuntimeError::ConfigError(_))));
    m.load(&f16).unwrap();
}

#[test]
fn test_init_keeps_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = synth(dir.path(), DType::F32);
    let mut m = model(&path, 1, false);
    m.prefill("xyz").unwrap();
    let remaining = m.get_remain_token();
    assert!(remaining < 32);

    m.init(SamplingConfig::greedy()).unwrap();
    assert_eq!(m.get_remain_token(), remaining);
    m.reset_token();
    assert_eq!(m.get_remain_token(), 32);
}
