// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # runtime
//!
//! Text generation on top of the operator graph.
//!
//! The runtime takes:
//! - A model file (`model_file`): header, vocabulary and weight records.
//! - A [`ModelConfig`]: device, threads, context length, memory mapping.
//! - A [`SamplingConfig`]: top-k, top-p, temperature, repetition penalty.
//!
//! And drives the decoder graph one pass per evaluation, sampling tokens
//! from the last row of logits and tracking [`InferenceMetrics`].
//!
//! # Example
//! ```no_run
//! use runtime::{Model, ModelConfig, SamplingConfig};
//!
//! let mut model = Model::new(ModelConfig::default(), "gpt")?;
//! model.load("./models/tiny-gpt.irtm")?;
//! model.init(SamplingConfig::default())?;
//!
//! let mut token = 0;
//! let mut text = model.decode("Once upon a time", &mut token)?;
//! while model.get_remain_token() > 0 && !model.is_end_token(token) {
//!     text += &model.decode_iter(&mut token)?;
//! }
//! println!("{text}\n{}", model.decode_summary());
//! # Ok::<(), runtime::RuntimeError>(())
//! ```

mod config;
mod error;
pub mod gpt;
mod metrics;
mod model;
pub mod model_file;
mod sampler;
mod vocab;

pub use config::{ModelConfig, RuntimeConfig, SamplingConfig};
pub use error::RuntimeError;
pub use gpt::ModelArch;
pub use metrics::InferenceMetrics;
pub use model::Model;
pub use model_file::HyperParams;
pub use sampler::Sampler;
pub use vocab::{TokenId, TokenScore, Vocab};
