// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # op-graph
//!
//! The operator lifecycle protocol and the graph that drives it.
//!
//! - [`OpBase`] / [`Operator`]: per-operator state and overridable
//!   behaviour, with defaults for shape passthrough, weight loading and
//!   buffer preparation.
//! - [`Lifecycle`]: the state-checked driver (`deduce → init →
//!   {pre_execute → execute → end_execute}*`).
//! - [`ops`]: embedding, layer norm, linear, GELU, residual add and causal
//!   attention over a shared KV cache.
//! - [`Graph`]: type-state `Graph<Building>` → `Graph<Ready>`.
//!
//! # Example
//! ```
//! use device::{CpuDevice, Device};
//! use op_graph::{ops::Gelu, Graph};
//! use std::sync::Arc;
//! use tensor_core::DType;
//!
//! let device: Arc<dyn Device> = Arc::new(CpuDevice::new(2));
//! let mut graph = Graph::new("demo", device);
//! let x = graph.add_input("x", DType::F32);
//! let base = graph.op_base("act", vec![x.clone()]);
//! let y = graph.add_op(Gelu::new(base));
//!
//! let mut graph = graph.build(4);
//! graph.reshape(2);
//! x.copy_from(&[0.0f32, 1.0]);
//! graph.execute(0);
//! assert_eq!(y.to_vec::<f32>()[0], 0.0);
//! ```

pub mod graph;
mod op;
pub mod ops;
pub mod weights;
mod workspace;

pub use graph::{Building, Graph, GraphState, Ready};
pub use op::{Lifecycle, OpBase, OpState, Operator};
pub use workspace::WorkSpace;
