// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `infer-rt run` command: generate text from a prompt.
//!
//! The model runs on a blocking thread and streams decoded pieces back over
//! a channel:
//! ```text
//! spawn_blocking ── Model::new → load → init → decode → decode_iter* ──▶ mpsc ──▶ stdout
//!                                                          ▲
//! Ctrl-C ──────────────────────────────────── stop flag ───┘
//! ```

use anyhow::Context;
use device::DeviceKind;
use runtime::{InferenceMetrics, Model, RuntimeConfig, SamplingConfig};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tensor_core::DType;
use tokio::sync::mpsc;

#[derive(clap::Args, Debug, Default)]
pub struct RunArgs {
    /// Path to the model file.
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Registered architecture name.
    #[arg(long)]
    pub model_name: Option<String>,

    /// Input prompt for text generation.
    #[arg(short, long)]
    pub prompt: String,

    /// Maximum number of tokens to generate.
    #[arg(long, default_value_t = 64)]
    pub max_tokens: usize,

    /// Thread-pool participants, including the calling thread.
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Context length (0 uses the model's own).
    #[arg(long)]
    pub ctx: Option<usize>,

    /// Weight compute type: float32 or float16.
    #[arg(long)]
    pub compute: Option<DType>,

    /// Execution device: cpu or gpu.
    #[arg(long)]
    pub device: Option<DeviceKind>,

    /// Read weights into pooled buffers instead of mapping the file.
    #[arg(long)]
    pub no_mmap: bool,

    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub top_k: Option<usize>,

    #[arg(long)]
    pub top_p: Option<f32>,

    #[arg(long)]
    pub repeat_penalty: Option<f32>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Token id that ends generation.
    #[arg(long)]
    pub end_token: Option<i32>,

    /// Always pick the most likely token.
    #[arg(long)]
    pub greedy: bool,

    /// Print the result and metrics as JSON instead of streaming text.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Applies command-line overrides on top of a file configuration.
    fn apply(&self, config: &mut RuntimeConfig) {
        if let Some(path) = &self.model {
            config.model_path = Some(path.clone());
        }
        if let Some(name) = &self.model_name {
            config.model_name = Some(name.clone());
        }

        let model = &mut config.model;
        if let Some(n) = self.threads {
            model.nr_thread = Some(n);
        }
        if let Some(n) = self.ctx {
            model.nr_ctx = n;
        }
        if let Some(dtype) = self.compute {
            model.compt_type = dtype;
        }
        if let Some(kind) = self.device {
            model.device_type = kind;
        }
        if self.no_mmap {
            model.enable_mmap = false;
        }

        if self.greedy {
            config.sampling = SamplingConfig {
                seed: config.sampling.seed,
                end_token: config.sampling.end_token,
                ..SamplingConfig::greedy()
            };
        }
        let sampling = &mut config.sampling;
        if let Some(v) = self.temperature {
            sampling.temperature = v;
        }
        if let Some(v) = self.top_k {
            sampling.top_k = v;
        }
        if let Some(v) = self.top_p {
            sampling.top_p = v;
        }
        if let Some(v) = self.repeat_penalty {
            sampling.repeat_penalty = v;
        }
        if self.seed.is_some() {
            sampling.seed = self.seed;
        }
        if self.end_token.is_some() {
            sampling.end_token = self.end_token;
        }
    }
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    MaxTokens,
    EndToken,
    ContextFull,
    Interrupted,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::MaxTokens => "max_tokens",
            Self::EndToken => "end_token",
            Self::ContextFull => "context_full",
            Self::Interrupted => "interrupted",
        }
    }
}

struct Report {
    generated: usize,
    reason: StopReason,
    summary: String,
    metrics: InferenceMetrics,
}

pub async fn execute(config_path: Option<PathBuf>, args: RunArgs) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    args.apply(&mut config);
    let path = config
        .model_path
        .clone()
        .context("no model file: pass --model or set model_path in the config")?;
    tracing::info!(model = %path.display(), config = ?config, "starting generation");

    let stop = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let prompt = args.prompt.clone();
    let max_tokens = args.max_tokens;
    let worker_stop = Arc::clone(&stop);
    let worker = tokio::task::spawn_blocking(move || generate(config, path, &prompt, max_tokens, tx, &worker_stop));

    let mut text = String::new();
    let mut interrupted = false;
    let mut stdout = std::io::stdout();
    if !args.json {
        print!("{}", args.prompt);
    }
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            piece = rx.recv() => match piece {
                Some(piece) => {
                    if !args.json {
                        print!("{piece}");
                        stdout.flush()?;
                    }
                    text.push_str(&piece);
                }
                None => break,
            },
            _ = ctrl_c.as_mut(), if !interrupted => {
                tracing::warn!("interrupted; finishing the current token");
                stop.store(true, Ordering::Relaxed);
                interrupted = true;
            }
        }
    }

    let report = worker.await.context("generation thread panicked")??;
    if args.json {
        let out = serde_json::json!({
            "prompt": args.prompt,
            "text": text,
            "generated": report.generated,
            "stop_reason": report.reason.as_str(),
            "metrics": report.metrics,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!();
        println!("  Stopped: {} after {} tokens", report.reason.as_str(), report.generated);
        println!("  {}", report.summary);
    }
    Ok(())
}

/// Runs on a blocking thread: loads the model and streams pieces to `tx`.
fn generate(
    config: RuntimeConfig,
    path: PathBuf,
    prompt: &str,
    max_tokens: usize,
    tx: mpsc::Sender<String>,
    stop: &AtomicBool,
) -> anyhow::Result<Report> {
    let mut model = Model::new(config.model.clone(), config.model_name())?;
    model
        .load(&path)
        .with_context(|| format!("failed to load model from '{}'", path.display()))?;
    model.init(config.sampling.clone())?;

    let (generated, reason) = stream_tokens(&mut model, prompt, max_tokens, &tx, stop)?;
    model.idle();

    tracing::info!(generated, reason = reason.as_str(), "generation finished");
    Ok(Report {
        generated,
        reason,
        summary: model.decode_summary(),
        metrics: model.metrics().clone(),
    })
}

/// Evaluates `prompt` and sends up to `max_tokens` sampled pieces to `tx`.
fn stream_tokens(
    model: &mut Model,
    prompt: &str,
    max_tokens: usize,
    tx: &mpsc::Sender<String>,
    stop: &AtomicBool,
) -> anyhow::Result<(usize, StopReason)> {
    if max_tokens == 0 {
        model.prefill(prompt)?;
        return Ok((0, StopReason::MaxTokens));
    }

    let mut token = 0;
    let mut generated = 0;
    let mut piece = model.decode(prompt, &mut token)?;
    let reason = loop {
        if model.is_end_token(token) {
            break StopReason::EndToken;
        }
        if tx.blocking_send(piece).is_err() {
            break StopReason::Interrupted;
        }
        generated += 1;
        if generated >= max_tokens {
            break StopReason::MaxTokens;
        }
        if stop.load(Ordering::Relaxed) {
            break StopReason::Interrupted;
        }
        if model.get_remain_token() == 0 {
            break StopReason::ContextFull;
        }
        piece = model.decode_iter(&mut token)?;
    };
    Ok((generated, reason))
}
