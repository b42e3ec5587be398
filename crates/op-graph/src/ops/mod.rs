// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Concrete operators for a GPT-style decoder.
//!
//! Activations are f32 `[tokens, features]` matrices. Two-dimensional
//! weights may be stored as f32 or f16; norms and biases are always f32.

mod attention;
mod elementwise;
mod embedding;
mod layer_norm;
mod matmul;

pub use attention::Attention;
pub use elementwise::{Add, Gelu};
pub use embedding::Embedding;
pub use layer_norm::LayerNorm;
pub use matmul::MatMul;

use device::fatal;
use device::kernel::Weights;
use tensor_core::{DType, Tensor};

/// Views a materialized weight in its stored precision.
///
/// # Safety
/// The tensor must be materialized and not mutably viewed while the
/// returned view is live.
pub(crate) unsafe fn weights_of(t: &Tensor) -> Weights<'_> {
    match t.dtype() {
        DType::F32 => Weights::F32(t.as_slice()),
        DType::F16 => Weights::F16(t.as_slice()),
        other => fatal!("weight '{}' is {other}; kernels take f32 or f16 weights", t.name()),
    }
}
