// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `infer-rt inspect` command: display a model file's structure.
//!
//! Reads the header, vocabulary and weight record headers without
//! materializing any weight data.

use super::{mb, truncate};
use anyhow::Context;
use std::path::PathBuf;

pub async fn execute(model: PathBuf, json: bool) -> anyhow::Result<()> {
    let path = model.clone();
    let info = tokio::task::spawn_blocking(move || runtime::model_file::inspect(&path))
        .await?
        .with_context(|| format!("failed to inspect '{}'", model.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let hp = &info.hparams;
    // ── Summary ────────────────────────────────────────────────
    println!("  Model:      {}", model.display());
    println!("  File size:  {}", mb(info.file_bytes as usize));
    println!(
        "  Shape:      {} layers, {} embd, {} heads, {} ff, {} ctx",
        hp.n_layer, hp.n_embd, hp.n_head, hp.n_ff, hp.n_ctx,
    );
    println!(
        "  Vocabulary: {} tokens{}",
        info.vocab_size,
        if hp.has_scores { " (scored)" } else { "" },
    );
    println!("  Weights:    {} records, {} ({})", info.weights.len(), mb(info.weight_bytes()), hp.weight_dtype);
    println!("  Parameters: {:.2} M", hp.nr_params() as f64 / 1e6);
    println!();

    // ── Per-Record Detail ──────────────────────────────────────
    println!("  {:<4} {:<32} {:<8} {:<14} {:>12} {:>10}", "Idx", "Name", "DType", "Dims", "Offset", "Size");
    println!("  {}", "-".repeat(86));
    for (i, w) in info.weights.iter().enumerate() {
        let dims = w.dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("x");
        println!(
            "  {:<4} {:<32} {:<8} {:<14} {:>12} {:>7.1} KB",
            i,
            truncate(&w.name, 32),
            w.dtype.to_string(),
            dims,
            w.offset,
            w.bytes as f64 / 1024.0,
        );
    }
    println!();
    Ok(())
}
