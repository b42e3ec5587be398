// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

use super::weights_of;
use crate::{OpBase, Operator, WorkSpace};
use device::infer_assert;
use tensor_core::{DType, Shape};

/// A linear projection `y = x Wᵀ + b`.
///
/// The weight `{name}.weight` is `[n_out, n_in]` in the model's weight
/// dtype; the optional bias `{name}.bias` is `[n_out]` f32.
#[derive(Debug)]
pub struct MatMul {
    base: OpBase,
    n_in: usize,
    n_out: usize,
    bias: bool,
}

impl MatMul {
    pub fn new(mut base: OpBase, n_in: usize, n_out: usize, bias: bool, weight_dtype: DType) -> Self {
        let name = base.name().to_string();
        base.add_weight(format!("{name}.weight"), Shape::matrix(n_out, n_in), weight_dtype);
        if bias {
            base.add_weight(format!("{name}.bias"), Shape::vector(n_out), DType::F32);
        }
        base.add_output(name, DType::F32);
        Self { base, n_in, n_out, bias }
    }
}

impl Operator for MatMul {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "matmul"
    }

    fn nr_weights(&self) -> usize {
        1 + usize::from(self.bias)
    }

    fn deduce_output_shape(&mut self) {
        let src = self.base.input(0).shape();
        infer_assert!(
            src.last_dim() == self.n_in,
            "'{}' expects {} input features, got {src}",
            self.base.name(),
            self.n_in
        );
        self.base
            .output(0)
            .set_shape(Shape::matrix(src.rows(), self.n_out));
    }

    fn execute(&mut self, _workspace: &mut WorkSpace, _nr_past: usize) {
        let base = &self.base;
        // SAFETY: input, output and weights are materialized; the output is
        // distinct from everything read.
        unsafe {
            let bias = self.bias.then(|| base.weight(1).as_slice::<f32>());
            base.kernel().matmul(
                base.output(0).as_mut_slice(),
                base.input(0).as_slice(),
                weights_of(base.weight(0)),
                bias,
                self.n_in,
            )
        }
    }
}
