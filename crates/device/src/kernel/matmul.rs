// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Linear layer: `dst = src @ weightᵀ + bias`.

use super::{Kernel, SyncPtr, Weights};

impl Kernel {
    /// Computes a linear projection.
    ///
    /// `src` is `[m, k]`, `weight` is `[n, k]` (one row per output feature),
    /// `bias` is `[n]` and `dst` is `[m, n]`. Work is split over the `n`
    /// output features, so even a single-token decode step uses every
    /// participant.
    pub fn matmul(
        &self,
        dst: &mut [f32],
        src: &[f32],
        weight: Weights<'_>,
        bias: Option<&[f32]>,
        k: usize,
    ) {
        infer_assert!(k > 0 && src.len() % k == 0, "matmul input {} not a multiple of k={k}", src.len());
        infer_assert!(weight.len() % k == 0, "matmul weight {} not a multiple of k={k}", weight.len());
        let m = src.len() / k;
        let n = weight.len() / k;
        infer_assert!(dst.len() == m * n, "matmul output {} != {m}x{n}", dst.len());
        if let Some(b) = bias {
            infer_assert!(b.len() == n, "matmul bias {} != {n}", b.len());
        }

        let out = SyncPtr::new(dst);
        self.pool.add_task(
            &|id| {
                for j in id.units() {
                    let b = bias.map_or(0.0, |b| b[j]);
                    for i in 0..m {
                        let v = weight.row_dot(j, &src[i * k..(i + 1) * k]) + b;
                        // SAFETY: column j belongs to this partition.
                        unsafe { out.write(i * n + j, v) };
                    }
                }
            },
            n,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;
    use thread_pool::SpinBudget;

    fn naive(src: &[f32], w: &[f32], bias: Option<&[f32]>, k: usize) -> Vec<f32> {
        let m = src.len() / k;
        let n = w.len() / k;
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut acc = bias.map_or(0.0, |b| b[j]);
                for p in 0..k {
                    acc += src[i * k + p] * w[j * k + p];
                }
                out[i * n + j] = acc;
            }
        }
        out
    }

    #[test]
    fn test_matmul_2x3_times_3x2() {
        // A = [[1, 2, 3], [4, 5, 6]], Wᵀ columns [7, 9, 11] and [8, 10, 12].
        let kernel = Kernel::new(2, SpinBudget::default());
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let w = [7.0, 9.0, 11.0, 8.0, 10.0, 12.0];
        let mut c = [0.0f32; 4];
        kernel.matmul(&mut c, &a, Weights::F32(&w), None, 3);
        assert_eq!(c, [58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_matches_naive_with_bias() {
        let (m, k, n) = (3, 5, 13);
        let src: Vec<f32> = (0..m * k).map(|i| (i as f32 * 0.37).sin()).collect();
        let w: Vec<f32> = (0..n * k).map(|i| (i as f32 * 0.11).cos()).collect();
        let bias: Vec<f32> = (0..n).map(|i| i as f32 * 0.5).collect();

        let expected = naive(&src, &w, Some(&bias), k);
        for threads in [1, 2, 4] {
            let kernel = Kernel::new(threads, SpinBudget::default());
            let mut dst = vec![0.0f32; m * n];
            kernel.matmul(&mut dst, &src, Weights::F32(&w), Some(&bias), k);
            for (a, b) in dst.iter().zip(&expected) {
                assert!((a - b).abs() < 1e-5, "{threads} threads: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_matmul_f16_weights() {
        let kernel = Kernel::new(2, SpinBudget::default());
        let w = [0.5f32, -1.0, 2.0, 0.25];
        let h: Vec<f16> = w.iter().map(|&v| f16::from_f32(v)).collect();
        let src = [2.0f32, 4.0];
        let mut dst = [0.0f32; 2];
        kernel.matmul(&mut dst, &src, Weights::F16(&h), None, 2);
        assert_eq!(dst, [-3.0, 5.0]);
    }

    #[test]
    #[should_panic(expected = "matmul output")]
    fn test_matmul_bad_output_is_fatal() {
        let kernel = Kernel::new(1, SpinBudget::default());
        let mut dst = [0.0f32; 3];
        kernel.matmul(&mut dst, &[1.0, 2.0], Weights::F32(&[1.0, 2.0, 3.0, 4.0]), None, 2);
    }
}
