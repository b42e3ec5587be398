// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The execution graph: operators in static order over shared tensors.
//!
//! # Type-State Pattern
//!
//! ```text
//! Graph<Building>  ─ operators and tensors are being added.
//!       │  .build(max_tokens)
//!       ▼
//! Graph<Ready>     ─ shapes deduced, workspace allocated, operators
//!                    initialized; weights can be loaded and passes run.
//! ```
//!
//! Nothing can be executed before the workspace exists, and nothing can be
//! added once it does.

use crate::op::same_device;
use crate::{Lifecycle, OpBase, Operator, WorkSpace};
use device::{infer_assert, Device};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tensor_core::{DType, InputFile, OpId, Shape, StreamError, Tensor};

// ── Type-state markers ─────────────────────────────────────────────

/// Marker: operators are still being added.
#[derive(Debug, Clone)]
pub struct Building;

/// Marker: the graph is built and can execute.
#[derive(Debug, Clone)]
pub struct Ready;

/// Sealed trait for graph states.
pub trait GraphState: fmt::Debug + Clone {}
impl GraphState for Building {}
impl GraphState for Ready {}

// ── Graph ──────────────────────────────────────────────────────────

/// Operators in execution order plus the tensors only the graph owns.
pub struct Graph<S: GraphState = Building> {
    name: String,
    device: Arc<dyn Device>,
    ops: Vec<Box<dyn Operator>>,
    /// Tensors filled by the caller before each pass, `[n_tokens]` each.
    inputs: Vec<Arc<Tensor>>,
    /// Persistent tensors (KV caches), never released by user counting.
    shared: Vec<Arc<Tensor>>,
    workspace: Option<WorkSpace>,
    next_id: usize,
    max_tokens: usize,
    n_tokens: usize,
    _state: PhantomData<S>,
}

// ── Building state ─────────────────────────────────────────────────

impl Graph<Building> {
    /// Creates an empty graph on `device`.
    pub fn new(name: impl Into<String>, device: Arc<dyn Device>) -> Self {
        Self {
            name: name.into(),
            device,
            ops: Vec::new(),
            inputs: Vec::new(),
            shared: Vec::new(),
            workspace: None,
            next_id: 0,
            max_tokens: 0,
            n_tokens: 0,
            _state: PhantomData,
        }
    }

    /// Adds a per-token input tensor.
    pub fn add_input(&mut self, name: impl Into<String>, dtype: DType) -> Arc<Tensor> {
        let t = Arc::new(Tensor::new(self.device.clone(), name, Shape::vector(1), dtype));
        self.inputs.push(Arc::clone(&t));
        t
    }

    /// Adds a persistent tensor owned by the graph.
    pub fn add_shared(&mut self, name: impl Into<String>, shape: Shape, dtype: DType) -> Arc<Tensor> {
        let t = Arc::new(Tensor::new_shared(self.device.clone(), name, shape, dtype));
        self.shared.push(Arc::clone(&t));
        t
    }

    /// Starts a new operator on this graph's device.
    pub fn op_base(&mut self, name: impl Into<String>, inputs: Vec<Arc<Tensor>>) -> OpBase {
        let id = OpId(self.next_id);
        self.next_id += 1;
        OpBase::new(id, self.device.clone(), name, inputs)
    }

    /// Appends an operator and returns its first output.
    pub fn add_op(&mut self, op: impl Operator + 'static) -> Arc<Tensor> {
        let base = op.base();
        infer_assert!(
            same_device(base.device(), &self.device),
            "operator '{}' belongs to another device",
            base.name()
        );
        let out = Arc::clone(base.output(0));
        self.ops.push(Box::new(op));
        out
    }

    /// Deduces shapes at `max_tokens`, allocates the shared workspace and
    /// initializes every operator.
    pub fn build(mut self, max_tokens: usize) -> Graph<Ready> {
        infer_assert!(!self.ops.is_empty(), "graph '{}' has no operators", self.name);
        infer_assert!(max_tokens > 0, "graph '{}' built for zero tokens", self.name);

        for input in &self.inputs {
            input.set_shape(Shape::vector(max_tokens));
        }
        for op in &mut self.ops {
            op.deduce();
        }

        let ws_bytes = self.ops.iter().map(|op| op.workspace_bytes()).max().unwrap_or(0);
        let workspace = WorkSpace::new(self.device.clone(), ws_bytes);
        for op in &mut self.ops {
            op.init(&workspace);
        }
        for t in &self.shared {
            t.prepare_data();
        }

        tracing::info!(
            graph = %self.name,
            ops = self.ops.len(),
            workspace_bytes = ws_bytes,
            max_tokens,
            "graph built"
        );

        Graph {
            name: self.name,
            device: self.device,
            ops: self.ops,
            inputs: self.inputs,
            shared: self.shared,
            workspace: Some(workspace),
            next_id: self.next_id,
            max_tokens,
            n_tokens: max_tokens,
            _state: PhantomData,
        }
    }
}

// ── Ready state ────────────────────────────────────────────────────

impl Graph<Ready> {
    /// Reads every operator's weight records from `stream`, in graph order.
    pub fn load_weights(&mut self, stream: &Arc<InputFile>) -> Result<(), StreamError> {
        let start = Instant::now();
        for op in &mut self.ops {
            op.load_weights(stream)?;
        }
        tracing::info!(
            graph = %self.name,
            weight_bytes = self.weight_bytes(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "weights indexed"
        );
        Ok(())
    }

    /// Sets the token count of the next pass and re-deduces every shape.
    pub fn reshape(&mut self, n_tokens: usize) {
        infer_assert!(
            (1..=self.max_tokens).contains(&n_tokens),
            "graph '{}' reshaped to {n_tokens} tokens (max {})",
            self.name,
            self.max_tokens
        );
        for input in &self.inputs {
            input.set_shape(Shape::vector(n_tokens));
        }
        for op in &mut self.ops {
            op.deduce();
        }
        self.n_tokens = n_tokens;
    }

    /// Runs every operator once. Inputs must already hold this pass's data.
    pub fn execute(&mut self, nr_past: usize) {
        let start = Instant::now();
        for input in &self.inputs {
            infer_assert!(
                input.user_count() == 0 || input.is_materialized(),
                "graph input '{}' was not filled",
                input.name()
            );
            input.resume_user_count();
        }

        let Some(workspace) = self.workspace.as_mut() else {
            device::fatal!("graph '{}' executed without a workspace", self.name);
        };
        for op in &mut self.ops {
            op.forward(workspace, nr_past);
        }

        tracing::debug!(
            graph = %self.name,
            n_tokens = self.n_tokens,
            nr_past,
            elapsed_us = start.elapsed().as_micros() as u64,
            "graph pass"
        );
    }

    /// Token count of the current shapes.
    pub fn n_tokens(&self) -> usize {
        self.n_tokens
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn workspace_bytes(&self) -> usize {
        self.workspace.as_ref().map_or(0, WorkSpace::len)
    }
}

// ── Shared implementations ─────────────────────────────────────────

impl<S: GraphState> Graph<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Number of operators.
    pub fn nr_ops(&self) -> usize {
        self.ops.len()
    }

    /// Operators in execution order.
    pub fn ops(&self) -> &[Box<dyn Operator>] {
        &self.ops
    }

    /// A graph input by name.
    pub fn input(&self, name: &str) -> Option<&Arc<Tensor>> {
        self.inputs.iter().find(|t| t.name() == name)
    }

    /// An operator output by name.
    pub fn output(&self, name: &str) -> Option<&Arc<Tensor>> {
        self.ops
            .iter()
            .flat_map(|op| op.base().outputs())
            .find(|t| t.name() == name)
    }

    /// A graph-owned persistent tensor by name.
    pub fn shared(&self, name: &str) -> Option<&Arc<Tensor>> {
        self.shared.iter().find(|t| t.name() == name)
    }

    /// Bytes held by every weight tensor.
    pub fn weight_bytes(&self) -> usize {
        self.ops.iter().map(|op| op.base().weight_bytes()).sum()
    }

    /// Bytes held by the persistent tensors.
    pub fn shared_bytes(&self) -> usize {
        self.shared.iter().map(|t| t.length_in_bytes()).sum()
    }

    /// Returns a one-line summary.
    pub fn summary(&self) -> String {
        format!(
            "{}: {} ops, {} weights ({:.1} MB), kv cache {:.1} MB",
            self.name,
            self.ops.len(),
            self.ops.iter().map(|op| op.base().weights().len()).sum::<usize>(),
            self.weight_bytes() as f64 / (1024.0 * 1024.0),
            self.shared_bytes() as f64 / (1024.0 * 1024.0),
        )
    }
}

impl<S: GraphState> fmt::Display for Graph<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph: {}", self.name)?;
        for op in &self.ops {
            let base = op.base();
            let out = base.output(0);
            writeln!(
                f,
                "  {:<4} {:<12} {:<28} → {} ({} weights)",
                base.id().0,
                op.kind(),
                base.name(),
                out.shape(),
                base.weights().len()
            )?;
        }
        Ok(())
    }
}

impl<S: GraphState> fmt::Debug for Graph<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("device", &self.device.name())
            .field("ops", &self.ops.len())
            .field("max_tokens", &self.max_tokens)
            .field("n_tokens", &self.n_tokens)
            .finish()
    }
}
