// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

use crate::{OpBase, Operator, WorkSpace};
use device::infer_assert;
use tensor_core::DType;

/// Tanh-approximated GELU activation.
#[derive(Debug)]
pub struct Gelu {
    base: OpBase,
}

impl Gelu {
    pub fn new(mut base: OpBase) -> Self {
        let name = base.name().to_string();
        base.add_output(name, DType::F32);
        Self { base }
    }
}

impl Operator for Gelu {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "gelu"
    }

    fn nr_weights(&self) -> usize {
        0
    }

    fn execute(&mut self, _workspace: &mut WorkSpace, _nr_past: usize) {
        let base = &self.base;
        let (src, dst) = (base.input(0), base.output(0));
        // SAFETY: the protocol materialized both tensors, and they are
        // distinct.
        unsafe { base.kernel().gelu(dst.as_mut_slice(), src.as_slice()) }
    }
}

/// Element-wise sum of two equally shaped inputs (the residual path).
#[derive(Debug)]
pub struct Add {
    base: OpBase,
}

impl Add {
    pub fn new(mut base: OpBase) -> Self {
        infer_assert!(base.inputs().len() == 2, "'{}' adds two inputs, got {}", base.name(), base.inputs().len());
        let name = base.name().to_string();
        base.add_output(name, DType::F32);
        Self { base }
    }
}

impl Operator for Add {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "add"
    }

    fn nr_weights(&self) -> usize {
        0
    }

    fn deduce_output_shape(&mut self) {
        let base = &self.base;
        let (a, b) = (base.input(0).shape(), base.input(1).shape());
        infer_assert!(a == b, "'{}' shape mismatch: {a} + {b}", base.name());
        base.output(0).set_shape(a);
    }

    fn execute(&mut self, _workspace: &mut WorkSpace, _nr_past: usize) {
        let base = &self.base;
        let (a, b, dst) = (base.input(0), base.input(1), base.output(0));
        // SAFETY: all three are materialized; the output is distinct from
        // both inputs.
        unsafe { base.kernel().add(dst.as_mut_slice(), a.as_slice(), b.as_slice()) }
    }
}
