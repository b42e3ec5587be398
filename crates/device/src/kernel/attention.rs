// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Causal multi-head self-attention over a persistent KV cache.

use super::{Kernel, SyncPtr};

/// Key and value cache rows, `[n_ctx, n_embd]` each.
#[derive(Debug)]
pub struct KvCache<'a> {
    pub k: &'a mut [f32],
    pub v: &'a mut [f32],
}

/// Geometry of one attention call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionDims {
    pub n_head: usize,
    pub n_embd: usize,
    /// Tokens already in the cache before this call.
    pub nr_past: usize,
}

/// Numerically stable in-place softmax.
pub(crate) fn softmax_in_place(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / sum;
    for v in x.iter_mut() {
        *v *= inv;
    }
}

impl Kernel {
    /// Runs attention for the tokens in `qkv` (`[n_tokens, 3 * n_embd]`,
    /// laid out as `q | k | v`).
    ///
    /// The new keys and values are appended to `cache` at rows
    /// `nr_past..nr_past + n_tokens`; token `t` then attends to cache rows
    /// `0..=nr_past + t`. `scratch` must hold `n_head * (nr_past + n_tokens)`
    /// floats. Work is split over heads.
    pub fn attention(
        &self,
        dst: &mut [f32],
        qkv: &[f32],
        cache: KvCache<'_>,
        scratch: &mut [f32],
        dims: AttentionDims,
    ) {
        let AttentionDims { n_head, n_embd, nr_past } = dims;
        infer_assert!(n_head > 0 && n_embd % n_head == 0, "{n_embd} dims over {n_head} heads");
        infer_assert!(qkv.len() % (3 * n_embd) == 0, "qkv {} not a multiple of {}", qkv.len(), 3 * n_embd);
        let n_tokens = qkv.len() / (3 * n_embd);
        infer_assert!(dst.len() == n_tokens * n_embd, "attention output {} != {n_tokens}x{n_embd}", dst.len());
        let n_ctx = cache.k.len() / n_embd;
        let total = nr_past + n_tokens;
        infer_assert!(total <= n_ctx, "kv cache overflow: {total} > {n_ctx}");
        infer_assert!(scratch.len() >= n_head * total, "attention scratch {} < {}", scratch.len(), n_head * total);

        for t in 0..n_tokens {
            let row = &qkv[t * 3 * n_embd..(t + 1) * 3 * n_embd];
            let at = (nr_past + t) * n_embd;
            cache.k[at..at + n_embd].copy_from_slice(&row[n_embd..2 * n_embd]);
            cache.v[at..at + n_embd].copy_from_slice(&row[2 * n_embd..]);
        }

        let k_cache: &[f32] = cache.k;
        let v_cache: &[f32] = cache.v;
        let head_dim = n_embd / n_head;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let out = SyncPtr::new(dst);
        let scores = SyncPtr::new(scratch);

        self.pool.add_task(
            &|id| {
                for h in id.units() {
                    let off = h * head_dim;
                    // SAFETY: the scratch region of head h belongs to this partition.
                    let s = unsafe { scores.slice(h * total, total) };
                    for t in 0..n_tokens {
                        let q = &qkv[t * 3 * n_embd + off..t * 3 * n_embd + off + head_dim];
                        let visible = nr_past + t + 1;
                        for (j, sj) in s[..visible].iter_mut().enumerate() {
                            let k = &k_cache[j * n_embd + off..j * n_embd + off + head_dim];
                            *sj = q.iter().zip(k).map(|(a, b)| a * b).sum::<f32>() * scale;
                        }
                        softmax_in_place(&mut s[..visible]);

                        // SAFETY: columns of head h belong to this partition.
                        let o = unsafe { out.slice(t * n_embd + off, head_dim) };
                        o.fill(0.0);
                        for (j, &p) in s[..visible].iter().enumerate() {
                            let v = &v_cache[j * n_embd + off..j * n_embd + off + head_dim];
                            for (o, v) in o.iter_mut().zip(v) {
                                *o += p * v;
                            }
                        }
                    }
                }
            },
            n_head,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thread_pool::SpinBudget;

    #[test]
    fn test_softmax() {
        let mut x = [1.0f32, 2.0, 3.0];
        softmax_in_place(&mut x);
        assert!((x.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(x[2] > x[1] && x[1] > x[0]);

        // Large values do not overflow.
        let mut y = [1000.0f32, 1000.0];
        softmax_in_place(&mut y);
        assert!((y[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_first_token_attends_to_itself() {
        let kernel = Kernel::new(2, SpinBudget::default());
        let n_embd = 4;
        let qkv = [
            1.0, 0.0, 1.0, 0.0, // q
            0.5, 0.5, 0.5, 0.5, // k
            9.0, 8.0, 7.0, 6.0, // v
        ];
        let mut k = vec![0.0f32; 2 * n_embd];
        let mut v = vec![0.0f32; 2 * n_embd];
        let mut scratch = vec![0.0f32; 2];
        let mut dst = vec![0.0f32; n_embd];

        kernel.attention(
            &mut dst,
            &qkv,
            KvCache { k: &mut k, v: &mut v },
            &mut scratch,
            AttentionDims { n_head: 2, n_embd, nr_past: 0 },
        );

        // A single visible position gets all the weight.
        assert_eq!(dst, vec![9.0, 8.0, 7.0, 6.0]);
        assert_eq!(&k[..4], &[0.5; 4]);
        assert_eq!(&v[..4], &[9.0, 8.0, 7.0, 6.0]);
    }

    #[test]
    fn test_incremental_matches_batched() {
        let n_embd = 4;
        let n_head = 2;
        let qkv: Vec<f32> = (0..3 * 3 * n_embd).map(|i| ((i * 7) % 11) as f32 * 0.1).collect();

        let run = |threads: usize, split: bool| {
            let kernel = Kernel::new(threads, SpinBudget::default());
            let mut k = vec![0.0f32; 4 * n_embd];
            let mut v = vec![0.0f32; 4 * n_embd];
            let mut scratch = vec![0.0f32; n_head * 4];
            let mut dst = vec![0.0f32; 3 * n_embd];
            let dims = |nr_past| AttentionDims { n_head, n_embd, nr_past };
            if split {
                for t in 0..3 {
                    kernel.attention(
                        &mut dst[t * n_embd..(t + 1) * n_embd],
                        &qkv[t * 3 * n_embd..(t + 1) * 3 * n_embd],
                        KvCache { k: &mut k, v: &mut v },
                        &mut scratch,
                        dims(t),
                    );
                }
            } else {
                kernel.attention(&mut dst, &qkv, KvCache { k: &mut k, v: &mut v }, &mut scratch, dims(0));
            }
            dst
        };

        let batched = run(1, false);
        for (a, b) in batched.iter().zip(&run(2, true)) {
            assert!((a - b).abs() < 1e-5);
        }
        assert_eq!(batched, run(3, false));
    }

    #[test]
    #[should_panic(expected = "kv cache overflow")]
    fn test_cache_overflow_is_fatal() {
        let kernel = Kernel::new(1, SpinBudget::default());
        let mut k = vec![0.0f32; 4];
        let mut v = vec![0.0f32; 4];
        let mut dst = vec![0.0f32; 4];
        kernel.attention(
            &mut dst,
            &[0.0; 12],
            KvCache { k: &mut k, v: &mut v },
            &mut [0.0; 4],
            AttentionDims { n_head: 1, n_embd: 4, nr_past: 1 },
        );
    }
}
