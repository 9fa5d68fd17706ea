//! Batch executors.
//!
//! An [`Executor`] owns an ordered batch of same-signature nodes and runs
//! them as one unit. Each pass has three steps:
//!
//! 1. **Stage**: gather the members' inputs (and gradients, for backward)
//!    into contiguous buffers.
//! 2. **Run**: the scalar reference per member in `Cpu` mode, or one
//!    [`Kernels`] call for the whole batch otherwise. Verification mode then
//!    recomputes every member on the scalar path and compares.
//! 3. **Scatter**: copy outputs back into the members, or *add* gradient
//!    contributions into the inputs.
//!
//! Because backward contributions are computed into zeroed staging first and
//! then added, two members sharing an input both reach it, in batch order.

use crate::approx;
use crate::backend::ExecutionMode;
use crate::error::{GraphError, Result};
use crate::graph::NodeId;
use crate::node::{self, Node, NodeState, Op};
use crate::ops::{self, BackwardBatch, ForwardBatch, Kernels};
use crate::tensors::TensorFloat;
use rand::rngs::StdRng;
use rustc_hash::FxHashSet;

/// What an executor borrows from its graph for one pass.
pub(crate) struct ExecContext<'a> {
    pub mode: ExecutionMode,
    pub tolerance: f32,
    pub kernels: Option<&'a dyn Kernels>,
    pub rng: &'a mut StdRng,
}

/// Shape shared by every member of a validated batch.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchShape {
    dim: usize,
    in_dims: Vec<usize>,
}

/// A batch of type-equal nodes executed together.
#[derive(Debug, Clone, PartialEq)]
pub struct Executor {
    op: Op,
    signature: String,
    batch: Vec<NodeId>,
}

impl Executor {
    pub fn new(op: Op, signature: String, batch: Vec<NodeId>) -> Self {
        Self { op, signature, batch }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn batch(&self) -> &[NodeId] {
        &self.batch
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Appends a member; checked when the batch runs.
    pub fn push(&mut self, id: NodeId) {
        self.batch.push(id);
    }

    fn mismatch(&self, reason: impl Into<String>) -> GraphError {
        GraphError::BatchMismatch {
            signature: self.signature.clone(),
            reason: reason.into(),
        }
    }

    /// Validates the batch against the arena.
    ///
    /// Members must be distinct, registered, type-equal to the first member,
    /// of one shape, and mutually independent.
    fn check(&self, nodes: &[Node], graph: u32) -> Result<BatchShape> {
        let Some(&first_id) = self.batch.first() else {
            return Err(self.mismatch("empty batch"));
        };
        for &id in &self.batch {
            if id.graph() != graph {
                return Err(GraphError::ForeignNode { node: id });
            }
            if id.index() >= nodes.len() {
                return Err(GraphError::UnknownNode { node: id });
            }
        }
        let first = &nodes[first_id.index()];
        if first.op == Op::Input {
            return Err(self.mismatch("input nodes are not executable"));
        }
        if first.signature != self.signature {
            return Err(self.mismatch(format!("{} has signature `{}`", first.id, first.signature)));
        }

        let mut seen = FxHashSet::default();
        for &id in &self.batch {
            if !seen.insert(id) {
                return Err(self.mismatch(format!("{id} appears twice")));
            }
            let node = &nodes[id.index()];
            if !first.type_equal(node)? {
                return Err(self.mismatch(format!("{id} (`{}`) is not type-equal", node.signature)));
            }
            if node.dim != first.dim || node.in_dims != first.in_dims {
                return Err(self.mismatch(format!("{id} has a different shape")));
            }
        }

        // same-depth members can never depend on each other
        let staged = self.batch.iter().all(|id| nodes[id.index()].depth == first.depth);
        if !staged {
            self.check_independent(nodes)?;
        }

        Ok(BatchShape {
            dim: first.dim,
            in_dims: first.in_dims.clone(),
        })
    }

    fn check_independent(&self, nodes: &[Node]) -> Result<()> {
        for (i, &a) in self.batch.iter().enumerate() {
            for &b in &self.batch[i + 1..] {
                let (na, nb) = (&nodes[a.index()], &nodes[b.index()]);
                if na.depth != nb.depth && (depends_on(nodes, a, b) || depends_on(nodes, b, a)) {
                    return Err(self.mismatch(format!("{a} and {b} depend on each other")));
                }
            }
        }
        Ok(())
    }

    /// Computes every member's value.
    pub(crate) fn forward(&self, nodes: &mut [Node], graph: u32, ctx: &mut ExecContext<'_>) -> Result<()> {
        let shape = self.check(nodes, graph)?;
        for &id in &self.batch {
            for &input in &nodes[id.index()].inputs {
                if !nodes[input.index()].is_computed() {
                    return Err(GraphError::NotComputed { node: input });
                }
            }
        }

        // masks are drawn on the host in every mode
        if let Op::Dropout { rate, training } = self.op {
            for &id in &self.batch {
                let node = &mut nodes[id.index()];
                node.cache.mask = node::dropout_mask(node.dim, rate, training, ctx.rng);
            }
        }

        match (ctx.mode, ctx.kernels) {
            (ExecutionMode::Cpu, _) | (_, None) => {
                for &id in &self.batch {
                    let (head, tail) = nodes.split_at_mut(id.index());
                    let node = &mut tail[0];
                    let inputs: Vec<&[TensorFloat]> = node
                        .inputs
                        .iter()
                        .map(|i| head[i.index()].value.data.as_slice())
                        .collect();
                    node.op.compute(&inputs, &mut node.cache, &mut node.value.data);
                }
            }
            (mode, Some(kernels)) => {
                let mut staged = self.stage_forward(nodes, &shape);
                ops::dispatch::forward(kernels, self.op, &mut staged)?;
                if mode.verifies() {
                    self.verify_forward(nodes, &staged, ctx.tolerance)?;
                }
                for (m, &id) in self.batch.iter().enumerate() {
                    let node = &mut nodes[id.index()];
                    node.value.data.copy_from_slice(staged.output(m));
                    if let Some(&i) = staged.argmax.get(m) {
                        node.cache.argmax = i as usize;
                    }
                }
            }
        }

        for &id in &self.batch {
            nodes[id.index()].state = NodeState::Computed;
        }
        Ok(())
    }

    fn stage_forward(&self, nodes: &[Node], shape: &BatchShape) -> ForwardBatch {
        let mut staged = ForwardBatch::new(self.op, self.batch.len(), shape.dim, &shape.in_dims);
        for &id in &self.batch {
            let node = &nodes[id.index()];
            for (slot, input) in node.inputs.iter().enumerate() {
                staged.inputs[slot].extend_from_slice(&nodes[input.index()].value.data);
            }
            staged.mask.extend_from_slice(&node.cache.mask);
        }
        staged
    }

    fn verify_forward(&self, nodes: &[Node], staged: &ForwardBatch, tolerance: f32) -> Result<()> {
        for (m, &id) in self.batch.iter().enumerate() {
            let node = &nodes[id.index()];
            let inputs: Vec<&[TensorFloat]> =
                node.inputs.iter().map(|i| nodes[i.index()].value.data.as_slice()).collect();
            let mut cache = node.cache.clone();
            let mut expected = vec![0.0; node.dim];
            node.op.compute(&inputs, &mut cache, &mut expected);

            let got = staged.output(m);
            if let Some(index) = approx::first_mismatch(got, &expected, tolerance) {
                return Err(GraphError::VerificationMismatch {
                    stage: "forward",
                    op: self.op.name(),
                    node: id,
                    index,
                    expected: expected.get(index).copied().unwrap_or(f32::NAN),
                    got: got.get(index).copied().unwrap_or(f32::NAN),
                });
            }
            if let Some(&argmax) = staged.argmax.get(m) {
                if argmax as usize != cache.argmax {
                    return Err(GraphError::VerificationMismatch {
                        stage: "forward",
                        op: self.op.name(),
                        node: id,
                        index: 0,
                        expected: cache.argmax as f32,
                        got: argmax as f32,
                    });
                }
            }
        }
        tracing::debug!(signature = %self.signature, batch = self.batch.len(), "forward verified");
        Ok(())
    }

    /// Adds every member's gradient contribution into its inputs.
    ///
    /// Members must be computed; a member without a gradient buffer
    /// contributes zero.
    pub(crate) fn backward(&self, nodes: &mut [Node], graph: u32, ctx: &mut ExecContext<'_>) -> Result<()> {
        let shape = self.check(nodes, graph)?;
        for &id in &self.batch {
            if !nodes[id.index()].is_computed() {
                return Err(GraphError::NotComputed { node: id });
            }
        }

        let contributions: Vec<Vec<Vec<TensorFloat>>> = match (ctx.mode, ctx.kernels) {
            (ExecutionMode::Cpu, _) | (_, None) => self
                .batch
                .iter()
                .map(|&id| reference_backward(nodes, id))
                .collect(),
            (mode, Some(kernels)) => {
                let mut staged = self.stage_backward(nodes, &shape);
                ops::dispatch::backward(kernels, self.op, &mut staged)?;
                if mode.verifies() {
                    self.verify_backward(nodes, &staged, ctx.tolerance)?;
                }
                (0..self.batch.len())
                    .map(|m| (0..shape.in_dims.len()).map(|s| staged.input_grad(s, m).to_vec()).collect())
                    .collect()
            }
        };

        for (&id, slots) in self.batch.iter().zip(contributions) {
            let inputs = nodes[id.index()].inputs.clone();
            for (input, contribution) in inputs.into_iter().zip(slots) {
                nodes[input.index()].grad_mut().add_assign(&contribution);
            }
            nodes[id.index()].state = NodeState::Differentiated;
        }
        Ok(())
    }

    fn stage_backward(&self, nodes: &[Node], shape: &BatchShape) -> BackwardBatch {
        let mut staged = BackwardBatch::new(self.batch.len(), shape.dim, &shape.in_dims);
        for &id in &self.batch {
            let node = &nodes[id.index()];
            for (slot, input) in node.inputs.iter().enumerate() {
                staged.inputs[slot].extend_from_slice(&nodes[input.index()].value.data);
            }
            staged.value.extend_from_slice(&node.value.data);
            match &node.grad {
                Some(grad) => staged.grad.extend_from_slice(&grad.data),
                None => staged.grad.resize(staged.grad.len() + node.dim, 0.0),
            }
            staged.mask.extend_from_slice(&node.cache.mask);
            if self.op == Op::MaxScalar {
                staged.argmax.push(node.cache.argmax as u32);
            }
        }
        staged
    }

    fn verify_backward(&self, nodes: &[Node], staged: &BackwardBatch, tolerance: f32) -> Result<()> {
        for (m, &id) in self.batch.iter().enumerate() {
            let expected = reference_backward(nodes, id);
            for (slot, expected) in expected.iter().enumerate() {
                let got = staged.input_grad(slot, m);
                if let Some(index) = approx::first_mismatch(got, expected, tolerance) {
                    return Err(GraphError::VerificationMismatch {
                        stage: "backward",
                        op: self.op.name(),
                        node: id,
                        index,
                        expected: expected.get(index).copied().unwrap_or(f32::NAN),
                        got: got.get(index).copied().unwrap_or(f32::NAN),
                    });
                }
            }
        }
        tracing::debug!(signature = %self.signature, batch = self.batch.len(), "backward verified");
        Ok(())
    }
}

/// Scalar reference contributions of one node, one zero-based buffer per input slot.
fn reference_backward(nodes: &[Node], id: NodeId) -> Vec<Vec<TensorFloat>> {
    let node = &nodes[id.index()];
    let inputs: Vec<&[TensorFloat]> = node.inputs.iter().map(|i| nodes[i.index()].value.data.as_slice()).collect();
    let mut slots: Vec<Vec<TensorFloat>> = inputs.iter().map(|x| vec![0.0; x.len()]).collect();
    let zero;
    let grad = match &node.grad {
        Some(grad) => grad.data.as_slice(),
        None => {
            zero = vec![0.0; node.dim];
            zero.as_slice()
        }
    };
    let mut views: Vec<&mut [TensorFloat]> = slots.iter_mut().map(Vec::as_mut_slice).collect();
    node.op.backward(&inputs, &node.value.data, grad, &node.cache, &mut views);
    slots
}

/// Whether `ancestor` is reachable from `node` through inputs.
fn depends_on(nodes: &[Node], node: NodeId, ancestor: NodeId) -> bool {
    let target_depth = nodes[ancestor.index()].depth;
    let mut stack = vec![node];
    let mut visited = FxHashSet::default();
    while let Some(id) = stack.pop() {
        if id == ancestor {
            return true;
        }
        let current = &nodes[id.index()];
        if current.depth <= target_depth || !visited.insert(id) {
            continue;
        }
        stack.extend(current.inputs.iter().copied());
    }
    false
}

