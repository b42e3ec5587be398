// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

use crate::{OpBase, Operator, WorkSpace};
use device::infer_assert;
use device::kernel::{AttentionDims, KvCache};
use std::sync::Arc;
use tensor_core::{DType, Shape, Tensor};

/// Causal multi-head self-attention.
///
/// Input: the fused `[n, 3 * n_embd]` query/key/value projection.
/// Output: `[n, n_embd]` attention values (before the output projection).
/// The key and value caches are shared graph tensors of shape
/// `[n_ctx, n_embd]`; each pass appends rows at `nr_past`.
#[derive(Debug)]
pub struct Attention {
    base: OpBase,
    n_head: usize,
    n_embd: usize,
    n_ctx: usize,
    k_cache: Arc<Tensor>,
    v_cache: Arc<Tensor>,
}

impl Attention {
    pub fn new(mut base: OpBase, n_head: usize, k_cache: Arc<Tensor>, v_cache: Arc<Tensor>) -> Self {
        let shape = k_cache.shape();
        infer_assert!(shape.rank() == 2 && v_cache.shape() == shape, "kv cache shapes {shape} / {}", v_cache.shape());
        infer_assert!(k_cache.shared() && v_cache.shared(), "kv cache of '{}' must be shared", base.name());
        let (n_ctx, n_embd) = (shape.rows(), shape.last_dim());
        infer_assert!(n_head > 0 && n_embd % n_head == 0, "{n_embd} features over {n_head} heads");

        let name = base.name().to_string();
        base.add_output(name, DType::F32);
        Self {
            base,
            n_head,
            n_embd,
            n_ctx,
            k_cache,
            v_cache,
        }
    }
}

impl Operator for Attention {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }

    fn kind(&self) -> &'static str {
        "attention"
    }

    fn nr_weights(&self) -> usize {
        0
    }

    fn workspace_bytes(&self) -> usize {
        self.n_head * self.n_ctx * std::mem::size_of::<f32>()
    }

    fn deduce_output_shape(&mut self) {
        let qkv = self.base.input(0).shape();
        infer_assert!(
            qkv.last_dim() == 3 * self.n_embd,
            "'{}' expects fused qkv of width {}, got {qkv}",
            self.base.name(),
            3 * self.n_embd
        );
        self.base
            .output(0)
            .set_shape(Shape::matrix(qkv.rows(), self.n_embd));
    }

    fn pre_execute(&mut self) {
        self.k_cache.prepare_data();
        self.v_cache.prepare_data();
        let out = self.base.output(0);
        if out.curr_user_count() == 0 {
            out.resume_user_count();
            out.prepare_data();
        }
    }

    fn execute(&mut self, workspace: &mut WorkSpace, nr_past: usize) {
        let base = &self.base;
        let n_tokens = base.input(0).shape().rows();
        infer_assert!(
            nr_past + n_tokens <= self.n_ctx,
            "kv cache overflow: {nr_past} + {n_tokens} > {}",
            self.n_ctx
        );
        let scratch = workspace.f32_mut(self.n_head * (nr_past + n_tokens));
        let dims = AttentionDims {
            n_head: self.n_head,
            n_embd: self.n_embd,
            nr_past,
        };
        // SAFETY: input, output and both caches are materialized and
        // pairwise distinct; the caches are only viewed here.
        unsafe {
            let cache = KvCache {
                k: self.k_cache.as_mut_slice(),
                v: self.v_cache.as_mut_slice(),
            };
            base.kernel()
                .attention(base.output(0).as_mut_slice(), base.input(0).as_slice(), cache, scratch, dims)
        }
    }
}
