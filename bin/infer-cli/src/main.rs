// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # infer-rt
//!
//! Command-line interface for the inference runtime.
//!
//! ## Usage
//! ```bash
//! # Write a small random-weight model to play with
//! infer-rt synth --out ./models/tiny.irtm --n-layer 2 --n-embd 64
//!
//! # Generate text
//! infer-rt run --model ./models/tiny.irtm --prompt "Once upon a time" --threads 4
//!
//! # List header, vocabulary size and weight records
//! infer-rt inspect --model ./models/tiny.irtm --json
//! ```

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "infer-rt",
    about = "Thread-pooled transformer inference runtime",
    version,
    author
)]
struct Cli {
    /// Path to a TOML configuration file (CLI arguments override it).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (repeat for more: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate text from a prompt.
    Run(commands::run::RunArgs),

    /// Print a model file's header and weight records.
    Inspect {
        /// Path to the model file.
        #[arg(short, long)]
        model: PathBuf,

        /// Print machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Write a model file with random weights.
    Synth(commands::synth::SynthArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    commands::init_tracing(cli.verbose);

    match cli.command {
        Commands::Run(args) => commands::run::execute(cli.config, args).await,
        Commands::Inspect { model, json } => commands::inspect::execute(model, json).await,
        Commands::Synth(args) => commands::synth::execute(args).await,
    }
}
