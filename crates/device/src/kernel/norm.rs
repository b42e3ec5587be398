// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Layer normalization.

use super::{Kernel, SyncPtr};

impl Kernel {
    /// Applies layer normalization over rows of width `gamma.len()`:
    ///
    /// `dst = gamma * (x - mean) / sqrt(var + eps) + beta`
    pub fn layer_norm(&self, dst: &mut [f32], src: &[f32], gamma: &[f32], beta: &[f32], eps: f32) {
        let cols = gamma.len();
        infer_assert!(cols > 0 && beta.len() == cols, "layer_norm gamma {cols} / beta {}", beta.len());
        infer_assert!(src.len() == dst.len() && src.len() % cols == 0, "layer_norm {} -> {} over {cols}", src.len(), dst.len());
        let rows = src.len() / cols;

        let out = SyncPtr::new(dst);
        self.pool.add_task(
            &|id| {
                for row in id.units() {
                    let x = &src[row * cols..(row + 1) * cols];
                    // SAFETY: row belongs to this partition.
                    let y = unsafe { out.slice(row * cols, cols) };

                    let mean = x.iter().sum::<f32>() / cols as f32;
                    let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / cols as f32;
                    let inv_std = 1.0 / (var + eps).sqrt();
                    for c in 0..cols {
                        y[c] = gamma[c] * (x[c] - mean) * inv_std + beta[c];
                    }
                }
            },
            rows,
        );
    }
}
