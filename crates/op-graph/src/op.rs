// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The operator lifecycle protocol.
//!
//! Every operator carries an [`OpBase`] and implements [`Operator`]. The
//! graph drives it through [`Lifecycle`], which enforces the state order:
//!
//! ```text
//! Constructed ─deduce─▶ ShapeDeduced ─init─▶ Initialized
//!                                              │   ▲
//!                                   pre_execute│   │end_execute
//!                                              ▼   │
//!                                  PreExecuted ─execute─▶ Executed
//! ```
//!
//! An `Initialized` operator may re-deduce its output shapes between
//! passes. Any other transition is fatal.

use crate::weights::load_weight;
use crate::WorkSpace;
use device::{fatal, infer_assert, Device, Kernel};
use std::fmt;
use std::sync::Arc;
use tensor_core::{DType, InputFile, OpId, Shape, StreamError, Tensor};

/// Where an operator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Constructed,
    ShapeDeduced,
    Initialized,
    PreExecuted,
    Executed,
}

impl fmt::Display for OpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Constructed => "constructed",
            Self::ShapeDeduced => "shape-deduced",
            Self::Initialized => "initialized",
            Self::PreExecuted => "pre-executed",
            Self::Executed => "executed",
        };
        f.write_str(s)
    }
}

/// Whether two handles refer to the same device instance.
pub(crate) fn same_device(a: &Arc<dyn Device>, b: &Arc<dyn Device>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

/// State common to every operator.
pub struct OpBase {
    id: OpId,
    name: String,
    device: Arc<dyn Device>,
    inputs: Vec<Arc<Tensor>>,
    outputs: Vec<Arc<Tensor>>,
    weights: Vec<Arc<Tensor>>,
    state: OpState,
}

impl OpBase {
    /// Binds an operator to its device and inputs.
    ///
    /// Registers the operator as one more user of every input. Inputs on a
    /// different device are fatal.
    pub fn new(id: OpId, device: Arc<dyn Device>, name: impl Into<String>, inputs: Vec<Arc<Tensor>>) -> Self {
        let name = name.into();
        for input in &inputs {
            infer_assert!(
                same_device(input.device(), &device),
                "input '{}' of '{name}' lives on another device",
                input.name()
            );
            input.add_user();
        }
        Self {
            id,
            name,
            device,
            inputs,
            outputs: Vec::new(),
            weights: Vec::new(),
            state: OpState::Constructed,
        }
    }

    /// Creates an output tensor owned by this operator.
    ///
    /// Its shape is filled in by `deduce_output_shape`.
    pub fn add_output(&mut self, name: impl Into<String>, dtype: DType) -> Arc<Tensor> {
        let t = Arc::new(Tensor::new(self.device.clone(), name, Shape::default(), dtype));
        t.set_owner(self.id);
        self.outputs.push(Arc::clone(&t));
        t
    }

    /// Creates a weight tensor of fixed shape, filled by `load_weights`.
    pub fn add_weight(&mut self, name: impl Into<String>, shape: Shape, dtype: DType) -> Arc<Tensor> {
        let t = Arc::new(Tensor::new(self.device.clone(), name, shape, dtype));
        t.set_owner(self.id);
        self.weights.push(Arc::clone(&t));
        t
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn inputs(&self) -> &[Arc<Tensor>] {
        &self.inputs
    }

    pub fn input(&self, index: usize) -> &Arc<Tensor> {
        match self.inputs.get(index) {
            Some(t) => t,
            None => fatal!("'{}' has no input {index}", self.name),
        }
    }

    pub fn outputs(&self) -> &[Arc<Tensor>] {
        &self.outputs
    }

    pub fn output(&self, index: usize) -> &Arc<Tensor> {
        match self.outputs.get(index) {
            Some(t) => t,
            None => fatal!("'{}' has no output {index}", self.name),
        }
    }

    pub fn weights(&self) -> &[Arc<Tensor>] {
        &self.weights
    }

    pub fn weight(&self, index: usize) -> &Arc<Tensor> {
        match self.weights.get(index) {
            Some(t) => t,
            None => fatal!("'{}' has no weight {index}", self.name),
        }
    }

    pub fn state(&self) -> OpState {
        self.state
    }

    /// The device's CPU kernels. A device without kernels is fatal.
    pub fn kernel(&self) -> &Kernel {
        match self.device.kernel() {
            Some(k) => k,
            None => fatal!("'{}': {} has no compute kernels", self.name, self.device.name()),
        }
    }

    /// Total bytes held by the weight tensors.
    pub fn weight_bytes(&self) -> usize {
        self.weights.iter().map(|w| w.length_in_bytes()).sum()
    }

    fn advance(&mut self, from: &[OpState], to: OpState) {
        infer_assert!(
            from.contains(&self.state),
            "'{}' cannot move to {to} from {} (expected one of {from:?})",
            self.name,
            self.state
        );
        self.state = to;
    }
}

impl fmt::Debug for OpBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |ts: &[Arc<Tensor>]| ts.iter().map(|t| t.name().to_string()).collect::<Vec<_>>();
        f.debug_struct("OpBase")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("device", &self.device.name())
            .field("inputs", &names(&self.inputs))
            .field("outputs", &names(&self.outputs))
            .field("weights", &names(&self.weights))
            .field("state", &self.state)
            .finish()
    }
}

/// Behaviour of one graph operator.
///
/// Only [`base`](Operator::base) and [`base_mut`](Operator::base_mut) are
/// required; every other method has the default protocol behaviour.
pub trait Operator: Send + fmt::Debug {
    fn base(&self) -> &OpBase;

    fn base_mut(&mut self) -> &mut OpBase;

    /// Short kind label used in summaries.
    fn kind(&self) -> &'static str;

    /// Sets output shapes from the current input shapes.
    ///
    /// The default copies the first input's shape and dtype to the first
    /// output.
    fn deduce_output_shape(&mut self) {
        let base = self.base();
        let (src, dst) = (base.input(0), base.output(0));
        dst.set_dtype(src.dtype());
        dst.set_shape(src.shape());
    }

    /// Scratch bytes needed at the largest token count.
    fn workspace_bytes(&self) -> usize {
        0
    }

    /// Number of weight records this operator reads.
    fn nr_weights(&self) -> usize {
        1
    }

    /// Reads this operator's weight records, in weight order.
    fn load_weights(&mut self, stream: &Arc<InputFile>) -> Result<(), StreamError> {
        let base = self.base();
        infer_assert!(
            base.weights().len() == self.nr_weights(),
            "'{}' declares {} weights but holds {}",
            base.name(),
            self.nr_weights(),
            base.weights().len()
        );
        for w in base.weights() {
            load_weight(w, stream)?;
        }
        Ok(())
    }

    /// Materializes weights and outputs for the coming pass.
    fn pre_execute(&mut self) {
        let base = self.base();
        for w in base.weights() {
            w.prepare_data();
        }
        for out in base.outputs() {
            if out.curr_user_count() == 0 && !out.shared() {
                out.resume_user_count();
                out.prepare_data();
            }
        }
    }

    /// Computes the outputs. `nr_past` is the number of tokens already in
    /// any persistent cache.
    fn execute(&mut self, _workspace: &mut WorkSpace, _nr_past: usize) {}

    /// Releases this operator's hold on its inputs.
    fn end_execute(&mut self) {
        for input in self.base().inputs() {
            input.decrease_curr_user_count();
        }
    }
}

/// The state-checked driver over [`Operator`].
///
/// Implemented for every operator; the graph only calls these.
pub trait Lifecycle: Operator {
    /// Deduces output shapes, first at build time and again between passes.
    fn deduce(&mut self) {
        match self.base().state() {
            OpState::Constructed | OpState::ShapeDeduced => {
                self.deduce_output_shape();
                self.base_mut().advance(&[OpState::Constructed, OpState::ShapeDeduced], OpState::ShapeDeduced);
            }
            OpState::Initialized => self.deduce_output_shape(),
            other => fatal!("'{}' cannot deduce shapes while {other}", self.base().name()),
        }
    }

    /// Checks the shared workspace covers this operator. Once per build.
    fn init(&mut self, workspace: &WorkSpace) {
        let need = self.workspace_bytes();
        infer_assert!(
            workspace.len() >= need,
            "workspace underflow: '{}' needs {need} bytes, workspace has {}",
            self.base().name(),
            workspace.len()
        );
        self.base_mut().advance(&[OpState::ShapeDeduced], OpState::Initialized);
    }

    /// Runs one pass: `pre_execute → execute → end_execute`.
    fn forward(&mut self, workspace: &mut WorkSpace, nr_past: usize) {
        self.base_mut().advance(&[OpState::Initialized], OpState::PreExecuted);
        self.pre_execute();
        self.base_mut().advance(&[OpState::PreExecuted], OpState::Executed);
        self.execute(workspace, nr_past);
        self.end_execute();
        self.base_mut().advance(&[OpState::Executed], OpState::Initialized);
    }
}

impl<T: Operator + ?Sized> Lifecycle for T {}
