// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Inference profiling metrics.
//!
//! [`InferenceMetrics`] collects load, prefill and decode timings plus the
//! device pool's memory figures. [`Model::decode_summary`](crate::Model::decode_summary)
//! renders them for the CLI.

use device::AllocationStats;
use std::time::Duration;

/// Aggregate metrics for one model session.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct InferenceMetrics {
    /// Time to read the header, vocabulary and weight index.
    pub load_duration: Duration,
    /// Tokens evaluated without sampling (prompts and user input).
    pub prefill_tokens: usize,
    pub prefill_duration: Duration,
    /// Tokens produced by the sampler.
    pub decode_tokens: usize,
    pub decode_duration: Duration,
    /// Number of graph passes.
    pub passes: usize,
    /// Peak bytes handed out by the device pool.
    pub peak_memory_bytes: usize,
    /// Bytes the pool holds from the platform.
    pub reserved_bytes: usize,
    /// Share of allocations served from the pool.
    pub pool_hit_ratio: f64,
}

impl InferenceMetrics {
    /// Records a pass over prompt tokens.
    pub fn record_prefill(&mut self, tokens: usize, elapsed: Duration) {
        self.prefill_tokens += tokens;
        self.prefill_duration += elapsed;
        self.passes += 1;
    }

    /// Records a pass that produced one sampled token.
    pub fn record_decode(&mut self, elapsed: Duration) {
        self.decode_tokens += 1;
        self.decode_duration += elapsed;
        self.passes += 1;
    }

    /// Copies the device pool's memory figures.
    pub fn record_memory(&mut self, stats: &AllocationStats) {
        self.peak_memory_bytes = stats.peak_live_bytes;
        self.reserved_bytes = stats.reserved_bytes;
        self.pool_hit_ratio = stats.hit_ratio();
    }

    /// Clears the token counters, keeping load time.
    pub fn reset_tokens(&mut self) {
        *self = Self {
            load_duration: self.load_duration,
            ..Self::default()
        };
    }

    /// Prompt throughput.
    pub fn prefill_tokens_per_second(&self) -> f64 {
        rate(self.prefill_tokens, self.prefill_duration)
    }

    /// Generation throughput.
    pub fn tokens_per_second(&self) -> f64 {
        rate(self.decode_tokens, self.decode_duration)
    }

    /// Mean time per generated token.
    pub fn ms_per_token(&self) -> f64 {
        if self.decode_tokens == 0 {
            return 0.0;
        }
        self.decode_duration.as_secs_f64() * 1000.0 / self.decode_tokens as f64
    }

    /// Returns a human-readable summary suitable for CLI output.
    pub fn summary(&self) -> String {
        format!(
            "load {:.2}ms | prefill {} tokens in {:.2}ms ({:.1} tok/s) | \
             decode {} tokens in {:.2}ms ({:.2} ms/tok, {:.1} tok/s) | \
             peak {:.2} MB, reserved {:.2} MB, pool hits {:.0}%",
            self.load_duration.as_secs_f64() * 1000.0,
            self.prefill_tokens,
            self.prefill_duration.as_secs_f64() * 1000.0,
            self.prefill_tokens_per_second(),
            self.decode_tokens,
            self.decode_duration.as_secs_f64() * 1000.0,
            self.ms_per_token(),
            self.tokens_per_second(),
            self.peak_memory_bytes as f64 / (1024.0 * 1024.0),
            self.reserved_bytes as f64 / (1024.0 * 1024.0),
            self.pool_hit_ratio * 100.0,
        )
    }
}

fn rate(tokens: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || tokens == 0 {
        return 0.0;
    }
    tokens as f64 / secs
}
