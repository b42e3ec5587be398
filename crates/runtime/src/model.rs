// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The model façade: load, prompt and decode.
//!
//! ```text
//! Model::new(config, "gpt")   device + thread pool
//!   .load(path)               header, vocabulary, graph, weight index
//!   .init(sampling)           sampler
//!   .prefill(prompt)          evaluate without sampling
//!   .decode(input, &mut tok)  evaluate input, sample the first reply token
//!   .decode_iter(&mut tok)    evaluate tok, sample the next one
//! ```
//!
//! Tokens are appended to a KV cache of `n_ctx` rows;
//! [`get_remain_token`](Model::get_remain_token) says how many are left and
//! [`reset_token`](Model::reset_token) starts over.

use crate::gpt::{self, ModelArch};
use crate::model_file::HyperParams;
use crate::{InferenceMetrics, ModelConfig, RuntimeError, Sampler, SamplingConfig, TokenId, Vocab};
use device::{CpuDevice, Device, DeviceKind};
use op_graph::{Graph, Ready};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tensor_core::{DType, InputFile};

/// A loaded model and its decoding state.
struct Session {
    hparams: HyperParams,
    vocab: Vocab,
    graph: Graph<Ready>,
    n_ctx: usize,
    /// Tokens already in the KV cache.
    nr_past: usize,
    /// Logits of the last evaluated token.
    last_logits: Vec<f32>,
}

/// A language model ready to generate text.
pub struct Model {
    config: ModelConfig,
    arch: ModelArch,
    device: Arc<dyn Device>,
    session: Option<Session>,
    sampler: Option<Sampler>,
    metrics: InferenceMetrics,
}

impl Model {
    /// Creates a model of the registered architecture `model_name`.
    ///
    /// Only CPU execution of f32/f16 weights is available. `compt_type`
    /// names the weight precision the model file must have; activations
    /// are always f32.
    pub fn new(config: ModelConfig, model_name: &str) -> Result<Self, RuntimeError> {
        let arch: ModelArch = model_name.parse()?;
        match config.compt_type {
            DType::F32 | DType::F16 => {}
            other => return Err(RuntimeError::Unsupported(format!("compute type {other}"))),
        }
        let device: Arc<dyn Device> = match config.device_type {
            DeviceKind::Cpu => Arc::new(CpuDevice::new(config.resolve_threads())),
            DeviceKind::Gpu => {
                return Err(RuntimeError::Unsupported(
                    "graph execution on gpu has no kernels; use device_type = \"cpu\"".into(),
                ))
            }
        };

        tracing::info!(
            model = %arch,
            device = device.name(),
            threads = config.resolve_threads(),
            compt_type = %config.compt_type,
            "model created"
        );
        Ok(Self {
            config,
            arch,
            device,
            session: None,
            sampler: None,
            metrics: InferenceMetrics::default(),
        })
    }

    /// Loads a model file, replacing any loaded model.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), RuntimeError> {
        let start = Instant::now();
        let path = path.as_ref();
        self.session = None;

        let stream = Arc::new(InputFile::open(path, self.config.enable_mmap)?);
        let hparams = HyperParams::read(&stream)?;
        if hparams.weight_dtype != self.config.compt_type {
            return Err(RuntimeError::ConfigError(format!(
                "compt_type is {} but the model stores {} weights",
                self.config.compt_type, hparams.weight_dtype
            )));
        }
        let vocab = Vocab::load(&stream, hparams.n_vocab, hparams.has_scores)?;

        let n_ctx = self.config.resolve_ctx(hparams.n_ctx);
        let mut graph = match self.arch {
            ModelArch::Gpt => gpt::build_graph(self.device.clone(), &hparams, n_ctx),
        }
        .build(n_ctx);
        graph.load_weights(&stream)?;
        if !stream.is_eof()? {
            return Err(RuntimeError::ModelFormat(format!(
                "trailing bytes after the last weight at offset {}",
                stream.tell()?
            )));
        }

        self.metrics = InferenceMetrics {
            load_duration: start.elapsed(),
            ..Default::default()
        };
        tracing::info!(
            path = %path.display(),
            mapped = stream.is_mapped(),
            n_ctx,
            summary = %graph.summary(),
            "model loaded"
        );
        self.session = Some(Session {
            hparams,
            vocab,
            graph,
            n_ctx,
            nr_past: 0,
            last_logits: Vec::new(),
        });
        Ok(())
    }

    /// Sets the sampling parameters and empties the sampler's repetition
    /// window. The KV cache is kept; see [`reset_token`](Model::reset_token).
    pub fn init(&mut self, sampling: SamplingConfig) -> Result<(), RuntimeError> {
        sampling.validate()?;
        self.sampler = Some(Sampler::new(sampling));
        Ok(())
    }

    /// Tokens that still fit in the context.
    pub fn get_remain_token(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.n_ctx - s.nr_past)
    }

    /// Empties the context.
    pub fn reset_token(&mut self) {
        if let Some(s) = self.session.as_mut() {
            s.nr_past = 0;
            s.last_logits.clear();
        }
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.reset();
        }
        self.metrics.reset_tokens();
    }

    /// Evaluates a prompt without sampling.
    pub fn prefill(&mut self, prompt: &str) -> Result<(), RuntimeError> {
        let ids = self.session()?.vocab.tokenize(prompt);
        if ids.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        self.eval(&ids)?;
        self.metrics.record_prefill(ids.len(), start.elapsed());
        Ok(())
    }

    /// Evaluates `input`, then samples the first reply token into `token`
    /// and returns its text.
    pub fn decode(&mut self, input: &str, token: &mut TokenId) -> Result<String, RuntimeError> {
        self.sampler_ref()?;
        self.prefill(input)?;
        self.sample_next(token)
    }

    /// Evaluates `token`, then samples the next one into `token` and returns
    /// its text.
    pub fn decode_iter(&mut self, token: &mut TokenId) -> Result<String, RuntimeError> {
        self.sampler_ref()?;
        let start = Instant::now();
        self.eval(&[*token])?;
        let piece = self.sample_next(token)?;
        self.metrics.record_decode(start.elapsed());
        Ok(piece)
    }

    /// Timing and memory summary of the session so far.
    pub fn decode_summary(&self) -> String {
        self.metrics.summary()
    }

    /// Whether `token` ends generation.
    pub fn is_end_token(&self, token: TokenId) -> bool {
        self.sampler
            .as_ref()
            .and_then(|s| s.config().end_token)
            .is_some_and(|end| end == token)
    }

    /// Parks the thread-pool workers until the next pass.
    pub fn idle(&self) {
        if let Some(kernel) = self.device.kernel() {
            kernel.deactive();
        }
    }

    pub fn metrics(&self) -> &InferenceMetrics {
        &self.metrics
    }

    pub fn hparams(&self) -> Option<&HyperParams> {
        self.session.as_ref().map(|s| &s.hparams)
    }

    pub fn vocab(&self) -> Option<&Vocab> {
        self.session.as_ref().map(|s| &s.vocab)
    }

    /// One-line description of the loaded graph.
    pub fn graph_summary(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.graph.summary())
    }

    /// Logits of the most recently evaluated token.
    pub fn last_logits(&self) -> Option<&[f32]> {
        self.session
            .as_ref()
            .map(|s| s.last_logits.as_slice())
            .filter(|l| !l.is_empty())
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    fn session(&self) -> Result<&Session, RuntimeError> {
        self.session.as_ref().ok_or(RuntimeError::NotLoaded)
    }

    fn sampler_ref(&self) -> Result<&Sampler, RuntimeError> {
        self.session()?;
        self.sampler.as_ref().ok_or(RuntimeError::NotInitialized)
    }

    /// Runs one graph pass over `ids` and keeps the last row of logits.
    fn eval(&mut self, ids: &[TokenId]) -> Result<(), RuntimeError> {
        let session = self.session.as_mut().ok_or(RuntimeError::NotLoaded)?;
        let remaining = session.n_ctx - session.nr_past;
        if ids.len() > remaining {
            return Err(RuntimeError::ContextExhausted {
                needed: ids.len(),
                remaining,
            });
        }
        let n_vocab = session.hparams.n_vocab;
        if let Some(&bad) = ids.iter().find(|&&id| id < 0 || id as usize >= n_vocab) {
            return Err(RuntimeError::ConfigError(format!("token id {bad} outside vocabulary of {n_vocab}")));
        }

        let graph = &mut session.graph;
        graph.reshape(ids.len());
        let Some(input) = graph.input(gpt::TOKENS) else {
            return Err(RuntimeError::ModelFormat(format!("graph has no '{}' input", gpt::TOKENS)));
        };
        input.copy_from(ids);
        graph.execute(session.nr_past);

        let Some(logits) = graph.output(gpt::LOGITS) else {
            return Err(RuntimeError::ModelFormat(format!("graph has no '{}' output", gpt::LOGITS)));
        };
        let all = logits.to_vec::<f32>();
        session.last_logits.clear();
        session
            .last_logits
            .extend_from_slice(&all[(ids.len() - 1) * n_vocab..]);
        session.nr_past += ids.len();

        if let Some(sampler) = self.sampler.as_mut() {
            ids.iter().for_each(|&id| sampler.accept(id));
        }
        self.metrics.record_memory(&self.device.stats());
        Ok(())
    }

    fn sample_next(&mut self, token: &mut TokenId) -> Result<String, RuntimeError> {
        let session = self.session.as_ref().ok_or(RuntimeError::NotLoaded)?;
        let sampler = self.sampler.as_mut().ok_or(RuntimeError::NotInitialized)?;
        if session.last_logits.is_empty() {
            return Err(RuntimeError::EmptyInput);
        }
        *token = sampler.sample(&session.last_logits);
        Ok(session.vocab.unmap_to_token(*token).unwrap_or_default().to_string())
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("arch", &self.arch)
            .field("device", &self.device.name())
            .field("loaded", &self.session.is_some())
            .field("initialized", &self.sampler.is_some())
            .field("remaining", &self.get_remain_token())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_model_name() {
        let err = Model::new(ModelConfig::default(), "llama").unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownModel(_)));
    }

    #[test]
    fn test_gpu_is_rejected() {
        let config = ModelConfig {
            device_type: DeviceKind::Gpu,
            ..Default::default()
        };
        assert!(matches!(Model::new(config, "gpt"), Err(RuntimeError::Unsupported(_))));
    }

    #[test]
    fn test_quantized_compute_is_rejected() {
        let config = ModelConfig {
            compt_type: DType::I4,
            ..Default::default()
        };
        assert!(matches!(Model::new(config, "gpt"), Err(RuntimeError::Unsupported(_))));
    }

    #[test]
    fn test_calls_before_load() {
        let mut m = Model::new(ModelConfig::default(), "gpt").unwrap();
        assert_eq!(m.get_remain_token(), 0);
        assert!(matches!(m.prefill("hi"), Err(RuntimeError::NotLoaded)));
        let mut tok = 0;
        assert!(matches!(m.decode_iter(&mut tok), Err(RuntimeError::NotLoaded)));
        m.reset_token();
    }
}
