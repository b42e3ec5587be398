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

/// Token plus learned position embedding.
///
/// Input: i32 token ids `[n]`. Weights: `{name}.wte` `[n_vocab, n_embd]`
/// and `{name}.wpe` `[n_ctx, n_embd]`. Output: `[n, n_embd]`.
#[derive(Debug)]
pub struct Embedding {
    base: OpBase,
    n_embd: usize,
}

impl Embedding {
    pub fn new(mut base: OpBase, n_vocab: usize, n_ctx: usize, n_embd: usize, weight_dtype: DType) -> Self {
        let name = base.name().to_string();
        base.add_weight(format!("{name}.wte"), Shape::matrix(n_vocab, n_embd), weight_dtype);
        base.add_weight(format!("{name}.wpe"), Shape::matrix(n_ctx, n_embd), weight_dtype);
        base.add_output(name, DType::F32);
        Self { base, n_embd }
    }
}

impl Operator for Embedding {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "embedding"
    }

    fn nr_weights(&self) -> usize {
        2
    }

    fn deduce_output_shape(&mut self) {
        let ids = self.base.input(0);
        infer_assert!(ids.dtype() == DType::I32, "token ids are {}, expected int32", ids.dtype());
        self.base
            .output(0)
            .set_shape(Shape::matrix(ids.num_elements(), self.n_embd));
    }

    fn execute(&mut self, _workspace: &mut WorkSpace, nr_past: usize) {
        let base = &self.base;
        // SAFETY: ids, both tables and the output are materialized by the
        // protocol; only the output is written.
        unsafe {
            base.kernel().embedding(
                base.output(0).as_mut_slice(),
                base.input(0).as_slice::<i32>(),
                weights_of(base.weight(0)),
                weights_of(base.weight(1)),
                nr_past,
            )
        }
    }
}
