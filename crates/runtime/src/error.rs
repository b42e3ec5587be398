// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the inference runtime.

/// Errors that can occur while loading a model or generating with it.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The requested architecture is not registered.
    #[error("unknown model '{0}'; registered models: gpt")]
    UnknownModel(String),

    /// A valid request this build cannot serve.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The model file is malformed.
    #[error("invalid model file: {0}")]
    ModelFormat(String),

    /// An operation needs a loaded model.
    #[error("no model loaded; call load() first")]
    NotLoaded,

    /// An operation needs sampling parameters.
    #[error("sampler not initialized; call init() first")]
    NotInitialized,

    /// The KV cache cannot hold the request.
    #[error("context exhausted: {needed} tokens requested, {remaining} remaining")]
    ContextExhausted { needed: usize, remaining: usize },

    /// Nothing to evaluate and nothing to sample from.
    #[error("empty input and no previous logits to sample from")]
    EmptyInput,

    /// Reading the model file failed.
    #[error("model stream error: {0}")]
    Stream(#[from] tensor_core::StreamError),

    /// Writing a model file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
