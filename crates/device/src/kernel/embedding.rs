// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Token plus learned positional embedding lookup.

use super::{Kernel, SyncPtr, Weights};

impl Kernel {
    /// Writes `wte[ids[t]] + wpe[nr_past + t]` into row `t` of `dst`.
    ///
    /// Rows are `n_embd` wide. Token ids outside the table and positions
    /// beyond `wpe` are fatal.
    pub fn embedding(
        &self,
        dst: &mut [f32],
        ids: &[i32],
        wte: Weights<'_>,
        wpe: Weights<'_>,
        nr_past: usize,
    ) {
        let n_tokens = ids.len();
        infer_assert!(n_tokens > 0 && dst.len() % n_tokens == 0, "embedding output {} for {n_tokens} tokens", dst.len());
        let n_embd = dst.len() / n_tokens;
        let n_vocab = wte.len() / n_embd;
        let n_pos = wpe.len() / n_embd;
        if let Some(bad) = ids.iter().find(|&&id| id < 0 || id as usize >= n_vocab) {
            fatal!("token id {bad} outside vocabulary of {n_vocab}");
        }
        infer_assert!(nr_past + n_tokens <= n_pos, "position {} beyond context {n_pos}", nr_past + n_tokens);

        let out = SyncPtr::new(dst);
        self.pool.add_task(
            &|id| {
                for t in id.units() {
                    // SAFETY: row t belongs to this partition.
                    let row = unsafe { out.slice(t * n_embd, n_embd) };
                    row.fill(0.0);
                    wte.add_row_into(ids[t] as usize, row);
                    wpe.add_row_into(nr_past + t, row);
                }
            },
            n_tokens,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thread_pool::SpinBudget;

    #[test]
    fn test_embedding_adds_position() {
        let kernel = Kernel::new(2, SpinBudget::default());
        // 3 tokens × 2 dims, 4 positions × 2 dims.
        let wte = [0.0, 0.0, 1.0, 1.0, 2.0, 2.0];
        let wpe = [0.0, 0.1, 0.0, 0.2, 0.0, 0.3, 0.0, 0.4];
        let mut dst = [0.0f32; 4];
        kernel.embedding(&mut dst, &[2, 1], Weights::F32(&wte), Weights::F32(&wpe), 1);
        for (a, b) in dst.iter().zip([2.0, 2.2, 1.0, 1.3]) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    #[should_panic(expected = "outside vocabulary")]
    fn test_embedding_bad_token_is_fatal() {
        let kernel = Kernel::new(1, SpinBudget::default());
        let mut dst = [0.0f32; 2];
        kernel.embedding(&mut dst, &[5], Weights::F32(&[0.0; 4]), Weights::F32(&[0.0; 4]), 0);
    }
}
