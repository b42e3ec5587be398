// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Runtime configuration loaded from TOML files or constructed programmatically.
//!
//! # TOML Format
//! ```toml
//! model_path = "./models/tiny-gpt.irtm"
//! model_name = "gpt"
//!
//! [model]
//! compt_type = "float32"
//! device_type = "cpu"
//! nr_thread = 4
//! nr_ctx = 256
//! enable_mmap = true
//!
//! [sampling]
//! top_k = 40
//! top_p = 0.95
//! temperature = 0.8
//! repeat_penalty = 1.1
//! repeat_last_n = 64
//! seed = 42
//! end_token = 0
//! ```

use crate::RuntimeError;
use device::DeviceKind;
use std::path::{Path, PathBuf};
use tensor_core::DType;

/// How the model is placed and executed.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Weight precision: `"float32"` or `"float16"`. Loading a model file
    /// whose weights differ is an error. Activations are always f32.
    pub compt_type: DType,
    /// `"cpu"` or `"gpu"`.
    pub device_type: DeviceKind,
    /// Thread-pool participants (defaults to the number of online cores).
    pub nr_thread: Option<usize>,
    /// Context length; 0 uses the model's own.
    pub nr_ctx: usize,
    /// Device ordinal for GPU placement.
    pub device_id: i32,
    /// Serve CPU weights straight from a memory map of the model file.
    pub enable_mmap: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            compt_type: DType::F32,
            device_type: DeviceKind::Cpu,
            nr_thread: None,
            nr_ctx: 0,
            device_id: 0,
            enable_mmap: true,
        }
    }
}

impl ModelConfig {
    /// Resolves the number of thread-pool participants.
    pub fn resolve_threads(&self) -> usize {
        self.nr_thread.filter(|&n| n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    /// Context length to run with, given the model's trained context.
    pub fn resolve_ctx(&self, model_ctx: usize) -> usize {
        match self.nr_ctx {
            0 => model_ctx,
            n if n > model_ctx => {
                tracing::warn!(requested = n, model_ctx, "context longer than the model's; clamping");
                model_ctx
            }
            n => n,
        }
    }
}

/// Token sampling parameters.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Keep only the `top_k` most likely tokens (0 keeps all).
    pub top_k: usize,
    /// Keep the smallest set of tokens whose probability mass reaches `top_p`.
    pub top_p: f32,
    /// Softmax temperature; 0 or below selects greedily.
    pub temperature: f32,
    /// Divides the logits of recently seen tokens (multiplies if negative).
    pub repeat_penalty: f32,
    /// How many recent tokens the repetition penalty looks at.
    pub repeat_last_n: usize,
    /// RNG seed; unseeded runs draw one from the OS.
    pub seed: Option<u64>,
    /// Token that ends generation.
    pub end_token: Option<i32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.95,
            temperature: 0.8,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: None,
            end_token: None,
        }
    }
}

impl SamplingConfig {
    /// Greedy selection: always the most likely token.
    pub fn greedy() -> Self {
        Self {
            top_k: 1,
            top_p: 1.0,
            temperature: 0.0,
            repeat_penalty: 1.0,
            ..Self::default()
        }
    }

    /// Rejects values the sampler cannot work with.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(RuntimeError::ConfigError(format!("top_p must be in (0, 1], got {}", self.top_p)));
        }
        if !(self.repeat_penalty > 0.0) {
            return Err(RuntimeError::ConfigError(format!(
                "repeat_penalty must be positive, got {}",
                self.repeat_penalty
            )));
        }
        if !self.temperature.is_finite() {
            return Err(RuntimeError::ConfigError("temperature must be finite".into()));
        }
        Ok(())
    }
}

/// Everything needed to start a generation session.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Path to the model file.
    pub model_path: Option<PathBuf>,
    /// Registered architecture name.
    pub model_name: Option<String>,
    pub model: ModelConfig,
    pub sampling: SamplingConfig,
}

impl RuntimeConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::ConfigError(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, RuntimeError> {
        toml::from_str(toml_str).map_err(|e| RuntimeError::ConfigError(format!("TOML parse error: {e}")))
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> Result<String, RuntimeError> {
        toml::to_string_pretty(self).map_err(|e| RuntimeError::ConfigError(format!("TOML serialise error: {e}")))
    }

    /// The architecture name, `"gpt"` unless configured.
    pub fn model_name(&self) -> &str {
        self.model_name.as_deref().unwrap_or("gpt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let c = RuntimeConfig::default();
        assert_eq!(c.model.compt_type, DType::F32);
        assert_eq!(c.model.device_type, DeviceKind::Cpu);
        assert!(c.model.enable_mmap);
        assert_eq!(c.sampling.top_k, 40);
        assert_eq!(c.model_name(), "gpt");
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
model_path = "/tmp/model.irtm"

[model]
compt_type = "float16"
device_type = "cpu"
nr_thread = 2
nr_ctx = 128
enable_mmap = false

[sampling]
top_k = 5
temperature = 0.0
seed = 7
end_token = 3
"#;
        let c = RuntimeConfig::from_toml(toml).unwrap();
        assert_eq!(c.model_path, Some(PathBuf::from("/tmp/model.irtm")));
        assert_eq!(c.model.compt_type, DType::F16);
        assert_eq!(c.model.resolve_threads(), 2);
        assert_eq!(c.model.nr_ctx, 128);
        assert!(!c.model.enable_mmap);
        assert_eq!(c.sampling.top_k, 5);
        assert_eq!(c.sampling.seed, Some(7));
        assert_eq!(c.sampling.end_token, Some(3));
        // Unset fields keep their defaults.
        assert_eq!(c.sampling.repeat_last_n, 64);
    }

    #[test]
    fn test_to_toml_roundtrip() {
        let mut c = RuntimeConfig::default();
        c.model.nr_thread = Some(3);
        c.sampling.seed = Some(11);
        let toml = c.to_toml().unwrap();
        let back = RuntimeConfig::from_toml(&toml).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = RuntimeConfig::from_toml("[model]\ndevice_type = \"tpu\"").unwrap_err();
        assert!(matches!(err, RuntimeError::ConfigError(_)));
    }

    #[test]
    fn test_resolve_threads() {
        let c = ModelConfig {
            nr_thread: Some(8),
            ..Default::default()
        };
        assert_eq!(c.resolve_threads(), 8);
        let c = ModelConfig {
            nr_thread: None,
            ..Default::default()
        };
        assert!(c.resolve_threads() >= 1);
    }

    #[test]
    fn test_resolve_ctx() {
        let mut c = ModelConfig::default();
        assert_eq!(c.resolve_ctx(64), 64);
        c.nr_ctx = 32;
        assert_eq!(c.resolve_ctx(64), 32);
        c.nr_ctx = 128;
        assert_eq!(c.resolve_ctx(64), 64);
    }

    #[test]
    fn test_sampling_validation() {
        assert!(SamplingConfig::default().validate().is_ok());
        assert!(SamplingConfig::greedy().validate().is_ok());
        let bad = SamplingConfig {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = SamplingConfig {
            repeat_penalty: -1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
