// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Element-wise kernels.

use super::{Kernel, SyncPtr};

/// Coefficient `sqrt(2/π)`.
const SQRT_2_OVER_PI: f32 = 0.797_884_6;

/// Cubic coefficient in the tanh approximation.
const GELU_COEFF: f32 = 0.044715;

/// GELU, tanh approximation (as in GPT-2).
#[inline(always)]
pub(crate) fn gelu_scalar(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

impl Kernel {
    /// `dst[i] = gelu(src[i])`.
    pub fn gelu(&self, dst: &mut [f32], src: &[f32]) {
        infer_assert!(dst.len() == src.len(), "gelu {} -> {}", src.len(), dst.len());
        let out = SyncPtr::new(dst);
        self.pool.add_task(
            &|id| {
                // SAFETY: the element range belongs to this partition.
                let y = unsafe { out.slice(id.start, id.len()) };
                for (y, &x) in y.iter_mut().zip(&src[id.units()]) {
                    *y = gelu_scalar(x);
                }
            },
            src.len(),
        );
    }

    /// `dst[i] = a[i] + b[i]`.
    pub fn add(&self, dst: &mut [f32], a: &[f32], b: &[f32]) {
        infer_assert!(
            a.len() == b.len() && a.len() == dst.len(),
            "add {} + {} -> {}",
            a.len(),
            b.len(),
            dst.len()
        );
        let out = SyncPtr::new(dst);
        self.pool.add_task(
            &|id| {
                // SAFETY: the element range belongs to this partition.
                let y = unsafe { out.slice(id.start, id.len()) };
                for ((y, x0), x1) in y.iter_mut().zip(&a[id.units()]).zip(&b[id.units()]) {
                    *y = x0 + x1;
                }
            },
            dst.len(),
        );
    }
}
