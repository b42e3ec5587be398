// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the weight stream.

use std::path::PathBuf;

/// Errors raised while reading a model file.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The file could not be opened or mapped.
    #[error("cannot open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An underlying read or seek failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record extends past the end of the file.
    #[error("truncated record: {needed} bytes at offset {offset}, file is {len} bytes")]
    Truncated { offset: u64, needed: usize, len: u64 },

    /// A string record is not valid UTF-8.
    #[error("invalid UTF-8 in string record at offset {offset}")]
    InvalidUtf8 { offset: u64 },

    /// A weight record does not match the tensor it is loaded into.
    #[error("weight mismatch for '{name}': {detail}")]
    WeightMismatch { name: String, detail: String },
}
