// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! GPT-2 style decoder graph.
//!
//! ```text
//! tokens ─▶ embed ─┬─▶ h.0.ln_1 ─▶ h.0.attn.c_attn ─▶ h.0.attn ─▶ h.0.attn.c_proj ─┐
//!                  └──────────────────────────────────────────────────────────▶ h.0.res_1
//!          h.0.res_1 ─┬─▶ h.0.ln_2 ─▶ h.0.mlp.c_fc ─▶ h.0.mlp.gelu ─▶ h.0.mlp.c_proj ─┐
//!                     └───────────────────────────────────────────────────────▶ h.0.res_2
//!          ... n_layer blocks ... ─▶ ln_f ─▶ lm_head (logits)
//! ```
//!
//! Weight records appear in the model file in exactly this operator order.

use crate::model_file::HyperParams;
use device::Device;
use op_graph::ops::{Add, Attention, Embedding, Gelu, LayerNorm, MatMul};
use op_graph::Graph;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tensor_core::{DType, Shape};

/// Name of the token-id graph input.
pub const TOKENS: &str = "tokens";

/// Name of the operator producing `[n_tokens, n_vocab]` logits.
pub const LOGITS: &str = "lm_head";

/// Registered model architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArch {
    Gpt,
}

impl FromStr for ModelArch {
    type Err = crate::RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gpt" | "gpt2" | "gpt-2" => Ok(Self::Gpt),
            _ => Err(crate::RuntimeError::UnknownModel(s.to_string())),
        }
    }
}

impl fmt::Display for ModelArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpt => f.write_str("gpt"),
        }
    }
}

/// Builds the decoder graph with a KV cache of `n_ctx` rows per layer.
///
/// `n_ctx` may be shorter than the model's trained context; the position
/// table is always sized from `hparams`.
pub fn build_graph(device: Arc<dyn Device>, hparams: &HyperParams, n_ctx: usize) -> Graph {
    let HyperParams {
        n_vocab,
        n_embd,
        n_head,
        n_layer,
        n_ff,
        weight_dtype: wt,
        ..
    } = *hparams;
    let eps = LayerNorm::DEFAULT_EPS;

    let mut g = Graph::new("gpt", device);
    let tokens = g.add_input(TOKENS, DType::I32);

    let base = g.op_base("embed", vec![tokens]);
    let mut x = g.add_op(Embedding::new(base, n_vocab, hparams.n_ctx, n_embd, wt));

    for i in 0..n_layer {
        let p = format!("h.{i}");
        let k_cache = g.add_shared(format!("{p}.k_cache"), Shape::matrix(n_ctx, n_embd), DType::F32);
        let v_cache = g.add_shared(format!("{p}.v_cache"), Shape::matrix(n_ctx, n_embd), DType::F32);

        let base = g.op_base(format!("{p}.ln_1"), vec![x.clone()]);
        let h = g.add_op(LayerNorm::new(base, n_embd, eps));
        let base = g.op_base(format!("{p}.attn.c_attn"), vec![h]);
        let qkv = g.add_op(MatMul::new(base, n_embd, 3 * n_embd, true, wt));
        let base = g.op_base(format!("{p}.attn"), vec![qkv]);
        let a = g.add_op(Attention::new(base, n_head, k_cache, v_cache));
        let base = g.op_base(format!("{p}.attn.c_proj"), vec![a]);
        let a = g.add_op(MatMul::new(base, n_embd, n_embd, true, wt));
        let base = g.op_base(format!("{p}.res_1"), vec![x, a]);
        let r = g.add_op(Add::new(base));

        let base = g.op_base(format!("{p}.ln_2"), vec![r.clone()]);
        let h = g.add_op(LayerNorm::new(base, n_embd, eps));
        let base = g.op_base(format!("{p}.mlp.c_fc"), vec![h]);
        let f = g.add_op(MatMul::new(base, n_embd, n_ff, true, wt));
        let base = g.op_base(format!("{p}.mlp.gelu"), vec![f]);
        let f = g.add_op(Gelu::new(base));
        let base = g.op_base(format!("{p}.mlp.c_proj"), vec![f]);
        let f = g.add_op(MatMul::new(base, n_ff, n_embd, true, wt));
        let base = g.op_base(format!("{p}.res_2"), vec![r, f]);
        x = g.add_op(Add::new(base));
    }

    let base = g.op_base("ln_f", vec![x]);
    let h = g.add_op(LayerNorm::new(base, n_embd, eps));
    let base = g.op_base(LOGITS, vec![h]);
    g.add_op(MatMul::new(base, n_embd, n_vocab, false, wt));
    g
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::CpuDevice;

    fn tiny() -> HyperParams {
        HyperParams {
            n_vocab: 10,
            n_embd: 8,
            n_head: 2,
            n_layer: 2,
            n_ff: 32,
            n_ctx: 16,
            weight_dtype: DType::F32,
            has_scores: false,
        }
    }

    #[test]
    fn test_arch_parse() {
        assert_eq!("GPT2".parse::<ModelArch>().unwrap(), ModelArch::Gpt);
        assert!("llama".parse::<ModelArch>().is_err());
    }

    #[test]
    fn test_graph_layout() {
        let g = build_graph(Arc::new(CpuDevice::new(1)), &tiny(), 16);
        // embed + 10 per layer + ln_f + lm_head
        assert_eq!(g.nr_ops(), 1 + 2 * 10 + 2);
        assert!(g.shared("h.1.v_cache").is_some());
        let names: Vec<String> = g
            .ops()
            .iter()
            .flat_map(|op| op.base().weights().iter().map(|w| w.name().to_string()).collect::<Vec<_>>())
            .collect();
        assert_eq!(names[0], "embed.wte");
        assert_eq!(names[2], "h.0.ln_1.weight");
        assert_eq!(names.last().map(String::as_str), Some("lm_head.weight"));
        // Per layer: 2 norms x 2 + 4 projections x 2.
        assert_eq!(names.len(), 2 + 2 * 12 + 2 + 1);
    }

    #[test]
    fn test_build_and_shapes() {
        let g = build_graph(Arc::new(CpuDevice::new(1)), &tiny(), 8).build(8);
        assert_eq!(g.output(LOGITS).unwrap().shape(), Shape::matrix(8, 10));
        assert_eq!(g.workspace_bytes(), 2 * 8 * 4);
    }
}
