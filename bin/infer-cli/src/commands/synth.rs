// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `infer-rt synth` command: write a random-weight model file.

use runtime::HyperParams;
use std::path::PathBuf;
use tensor_core::DType;

#[derive(clap::Args, Debug)]
pub struct SynthArgs {
    /// Output model file.
    #[arg(short, long)]
    pub out: PathBuf,

    #[arg(long, default_value_t = 800)]
    pub n_vocab: usize,

    #[arg(long, default_value_t = 64)]
    pub n_embd: usize,

    #[arg(long, default_value_t = 4)]
    pub n_head: usize,

    #[arg(long, default_value_t = 2)]
    pub n_layer: usize,

    /// Feed-forward width (defaults to 4 x n_embd).
    #[arg(long)]
    pub n_ff: Option<usize>,

    #[arg(long, default_value_t = 128)]
    pub n_ctx: usize,

    /// Weight type: float32 or float16.
    #[arg(long, default_value = "float32")]
    pub dtype: DType,

    /// Store a score with every vocabulary entry.
    #[arg(long)]
    pub scores: bool,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl SynthArgs {
    fn hparams(&self) -> HyperParams {
        HyperParams {
            n_vocab: self.n_vocab,
            n_embd: self.n_embd,
            n_head: self.n_head,
            n_layer: self.n_layer,
            n_ff: self.n_ff.unwrap_or(4 * self.n_embd),
            n_ctx: self.n_ctx,
            weight_dtype: self.dtype,
            has_scores: self.scores,
        }
    }
}

pub async fn execute(args: SynthArgs) -> anyhow::Result<()> {
    let hparams = args.hparams();
    hparams.validate()?;
    if let Some(dir) = args.out.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    let out = args.out.clone();
    tokio::task::spawn_blocking(move || runtime::model_file::synthesize(&out, &hparams, args.seed)).await??;

    println!(
        "  Wrote {} ({} layers, {:.2} M parameters, {})",
        args.out.display(),
        hparams.n_layer,
        hparams.nr_params() as f64 / 1e6,
        hparams.weight_dtype,
    );
    Ok(())
}
