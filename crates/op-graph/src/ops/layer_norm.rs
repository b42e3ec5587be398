// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

use crate::{OpBase, Operator, WorkSpace};
use device::infer_assert;
use tensor_core::{DType, Shape};

/// Layer normalization over the feature dimension.
#[derive(Debug)]
pub struct LayerNorm {
    base: OpBase,
    n_embd: usize,
    eps: f32,
}

impl LayerNorm {
    /// Epsilon used by GPT-2 checkpoints.
    pub const DEFAULT_EPS: f32 = 1e-5;

    pub fn new(mut base: OpBase, n_embd: usize, eps: f32) -> Self {
        let name = base.name().to_string();
        base.add_weight(format!("{name}.weight"), Shape::vector(n_embd), DType::F32);
        base.add_weight(format!("{name}.bias"), Shape::vector(n_embd), DType::F32);
        base.add_output(name, DType::F32);
        Self { base, n_embd, eps }
    }
}

impl Operator for LayerNorm {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "layer_norm"
    }

    fn nr_weights(&self) -> usize {
        2
    }

    fn deduce_output_shape(&mut self) {
        let src = self.base.input(0).shape();
        infer_assert!(
            src.last_dim() == self.n_embd,
            "'{}' normalizes {} features, input is {src}",
            self.base.name(),
            self.n_embd
        );
        self.base.output(0).set_shape(src);
    }

    fn execute(&mut self, _workspace: &mut WorkSpace, _nr_past: usize) {
        let base = &self.base;
        // SAFETY: input, output and both f32 weights are materialized; the
        // output is distinct from the input.
        unsafe {
            base.kernel().layer_norm(
                base.output(0).as_mut_slice(),
                base.input(0).as_slice(),
                base.weight(0).as_slice(),
                base.weight(1).as_slice(),
                self.eps,
            )
        }
    }
}
