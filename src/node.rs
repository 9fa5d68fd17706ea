//! Graph vertices and their operators.
//!
//! # Operators
//!
//! Operator behaviour is a closed sum type, [`Op`]. Each variant knows how to
//!
//! 1. validate its dimensionality ([`Op::init`]),
//! 2. compute its value from already computed inputs ([`Op::compute`]),
//! 3. add its local derivative into its inputs' gradients ([`Op::backward`]),
//! 4. describe itself for batching ([`Op::signature`], [`Op::type_equal`]).
//!
//! `compute` and `backward` here are the *scalar reference path*: one node at
//! a time, plain loops. Batched kernels in [`crate::ops`] must agree with them,
//! and verification mode checks that they do.
//!
//! ## Gradient Rules
//!
//! | op               | contribution to input gradient          |
//! |------------------|-----------------------------------------|
//! | activation       | `dy * f'(x, y)`                         |
//! | point-dot        | `dy[0] * b`, `dy[0] * a`                |
//! | point-multiply   | `dy * b`, `dy * a`                      |
//! | add              | `dy` to every input                     |
//! | sum              | `dy[0]` to every element                |
//! | max-scalar       | `dy[0]` to the argmax, nothing elsewhere |
//! | scalar-to-vector | `Σ dy`                                  |
//! | dropout          | `dy * mask`                             |
//!
//! Every rule accumulates (`+=`): a node with several parents receives one
//! contribution per parent.

use crate::error::{GraphError, Result};
use crate::executor::Executor;
use crate::graph::NodeId;
use crate::tensors::{Tensor, TensorFloat};
use rand::Rng;

/// Elementwise unary activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    Tanh,
    Sigmoid,
    Relu,
    Exp,
}

impl Activation {
    /// Operator tag.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Tanh => "tanh",
            Self::Sigmoid => "sigmoid",
            Self::Relu => "relu",
            Self::Exp => "exp",
        }
    }

    /// Code shared with the compute shaders.
    pub const fn code(self) -> u32 {
        match self {
            Self::Tanh => 0,
            Self::Sigmoid => 1,
            Self::Relu => 2,
            Self::Exp => 3,
        }
    }

    /// `f(x)`.
    #[inline]
    pub fn apply(self, x: TensorFloat) -> TensorFloat {
        match self {
            Self::Tanh => x.tanh(),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Relu => {
                if x > 0.0 {
                    x
                } else {
                    0.0
                }
            }
            Self::Exp => x.exp(),
        }
    }

    /// `f'(x)` expressed through the input `x` and the output `y = f(x)`.
    #[inline]
    pub fn derivative(self, x: TensorFloat, y: TensorFloat) -> TensorFloat {
        match self {
            Self::Tanh => 1.0 - y * y,
            Self::Sigmoid => y * (1.0 - y),
            Self::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Exp => y,
        }
    }
}

/// Every operator a node can apply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Leaf holding caller-supplied values; never executed.
    Input,
    /// Elementwise activation of one input.
    Activation(Activation),
    /// `Σ a_i b_i` of two equal-length inputs; output dimension 1.
    PointDot,
    /// `a ⊙ b` of two equal-length inputs.
    PointMul,
    /// Elementwise sum of `arity` equal-length inputs.
    Add { arity: usize },
    /// Sum of all elements; output dimension 1.
    Sum,
    /// Maximum element, first index on ties; output dimension 1.
    MaxScalar,
    /// Broadcast a 1-length input to the output dimension.
    ScalarToVector,
    /// Random masking (training) or `(1 - rate)` scaling (inference).
    Dropout { rate: f32, training: bool },
}

impl Op {
    /// Human-readable operator tag.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Activation(a) => a.name(),
            Self::PointDot => "point-dot",
            Self::PointMul => "point-multiply",
            Self::Add { .. } => "add",
            Self::Sum => "sum",
            Self::MaxScalar => "max-scalar",
            Self::ScalarToVector => "scalar-to-vector",
            Self::Dropout { .. } => "dropout",
        }
    }

    /// Number of inputs the operator consumes.
    pub const fn arity(&self) -> usize {
        match self {
            Self::Input => 0,
            Self::PointDot | Self::PointMul => 2,
            Self::Add { arity } => *arity,
            Self::Activation(_)
            | Self::Sum
            | Self::MaxScalar
            | Self::ScalarToVector
            | Self::Dropout { .. } => 1,
        }
    }

    /// Whether the output is a reduction of a longer input.
    pub const fn is_reduction(&self) -> bool {
        matches!(self, Self::PointDot | Self::Sum | Self::MaxScalar)
    }

    /// Validates the output dimension `dim` against the input dimensions.
    ///
    /// # Errors
    ///
    /// Any structurally invalid combination, e.g. a point-dot whose output is
    /// not 1, or a scalar-to-vector whose input is not 1.
    pub fn init(&self, dim: usize, in_dims: &[usize]) -> Result<()> {
        let op = self.name();
        if dim == 0 {
            return Err(GraphError::InvalidDimension {
                op,
                dim,
                reason: "dimension must be positive",
            });
        }
        if let Self::Add { arity: 0 } = self {
            return Err(GraphError::Arity {
                op,
                expected: 1,
                got: 0,
            });
        }
        if in_dims.len() != self.arity() {
            return Err(GraphError::Arity {
                op,
                expected: self.arity(),
                got: in_dims.len(),
            });
        }
        let same_as_output = |d: usize| {
            if d == dim {
                Ok(())
            } else {
                Err(GraphError::InputDimMismatch {
                    op,
                    expected: dim,
                    got: d,
                })
            }
        };

        match *self {
            Self::Input => Ok(()),
            Self::Activation(_) | Self::PointMul | Self::Add { .. } => {
                in_dims.iter().try_for_each(|&d| same_as_output(d))
            }
            Self::Dropout { rate, .. } => {
                if !(0.0..1.0).contains(&rate) {
                    return Err(GraphError::InvalidRate(rate));
                }
                same_as_output(in_dims[0])
            }
            Self::PointDot => {
                scalar_output(op, dim)?;
                if in_dims[0] == in_dims[1] {
                    Ok(())
                } else {
                    Err(GraphError::InputDimMismatch {
                        op,
                        expected: in_dims[0],
                        got: in_dims[1],
                    })
                }
            }
            Self::Sum | Self::MaxScalar => scalar_output(op, dim),
            Self::ScalarToVector => {
                if in_dims[0] == 1 {
                    Ok(())
                } else {
                    Err(GraphError::InvalidDimension {
                        op,
                        dim: in_dims[0],
                        reason: "input must be a scalar",
                    })
                }
            }
        }
    }

    /// Batching key: operator kind, shape and any configuration that changes
    /// the computation.
    ///
    /// Reductions include their input length so a batch never mixes lengths.
    /// Dropout includes its rate but not its training flag; see
    /// [`Op::type_equal`].
    pub fn signature(&self, dim: usize, in_dims: &[usize]) -> String {
        let name = self.name();
        match self {
            Self::PointDot | Self::Sum | Self::MaxScalar => {
                format!("{name}-{dim}-{}", in_dims.first().copied().unwrap_or(0))
            }
            Self::Add { arity } => format!("{name}-{dim}-{arity}"),
            Self::Dropout { rate, .. } => format!("{name}-{dim}-{rate:.6}"),
            _ => format!("{name}-{dim}"),
        }
    }

    /// Whether two operators sharing a signature may run in one batch.
    ///
    /// # Errors
    ///
    /// [`GraphError::TrainingModeMismatch`] when two dropouts agree on rate
    /// but not on training mode.
    pub fn type_equal(&self, other: &Op, signature: &str) -> Result<bool> {
        match (self, other) {
            (
                Self::Dropout { rate: r1, training: t1 },
                Self::Dropout { rate: r2, training: t2 },
            ) => {
                if t1 != t2 {
                    return Err(GraphError::TrainingModeMismatch {
                        signature: signature.to_string(),
                    });
                }
                Ok((r1 - r2).abs() < 0.001)
            }
            _ => Ok(self == other),
        }
    }

    /// Scalar reference forward: writes this node's value into `out`.
    ///
    /// Dropout reads its mask from `cache`, which the executor fills first;
    /// max-scalar stores its argmax there.
    pub fn compute(&self, inputs: &[&[TensorFloat]], cache: &mut NodeCache, out: &mut [TensorFloat]) {
        match *self {
            Self::Input => {}
            Self::Activation(a) => {
                for (y, &x) in out.iter_mut().zip(inputs[0]) {
                    *y = a.apply(x);
                }
            }
            Self::PointDot => {
                let mut sum: TensorFloat = 0.0;
                for (a, b) in inputs[0].iter().zip(inputs[1]) {
                    sum += a * b;
                }
                out[0] = sum;
            }
            Self::PointMul => {
                for ((y, a), b) in out.iter_mut().zip(inputs[0]).zip(inputs[1]) {
                    *y = a * b;
                }
            }
            Self::Add { .. } => {
                out.fill(0.0);
                for input in inputs {
                    for (y, x) in out.iter_mut().zip(*input) {
                        *y += x;
                    }
                }
            }
            Self::Sum => {
                let mut sum: TensorFloat = 0.0;
                for x in inputs[0] {
                    sum += x;
                }
                out[0] = sum;
            }
            Self::MaxScalar => {
                let (index, max) = first_max(inputs[0]);
                cache.argmax = index;
                out[0] = max;
            }
            Self::ScalarToVector => out.fill(inputs[0][0]),
            Self::Dropout { .. } => {
                for ((y, x), m) in out.iter_mut().zip(inputs[0]).zip(&cache.mask) {
                    *y = x * m;
                }
            }
        }
    }

    /// Scalar reference backward: adds this node's contribution into
    /// `input_grads`, one slice per input slot.
    pub fn backward(
        &self,
        inputs: &[&[TensorFloat]],
        value: &[TensorFloat],
        grad: &[TensorFloat],
        cache: &NodeCache,
        input_grads: &mut [&mut [TensorFloat]],
    ) {
        match *self {
            Self::Input => {}
            Self::Activation(a) => {
                for (((gx, &x), &y), &dy) in input_grads[0].iter_mut().zip(inputs[0]).zip(value).zip(grad) {
                    *gx += dy * a.derivative(x, y);
                }
            }
            Self::PointDot => {
                let dy = grad[0];
                for (slot, other) in [(0, 1), (1, 0)] {
                    for (gx, &x) in input_grads[slot].iter_mut().zip(inputs[other]) {
                        *gx += dy * x;
                    }
                }
            }
            Self::PointMul => {
                for (slot, other) in [(0, 1), (1, 0)] {
                    for ((gx, &x), &dy) in input_grads[slot].iter_mut().zip(inputs[other]).zip(grad) {
                        *gx += dy * x;
                    }
                }
            }
            Self::Add { .. } => {
                for slot in input_grads.iter_mut() {
                    for (gx, &dy) in slot.iter_mut().zip(grad) {
                        *gx += dy;
                    }
                }
            }
            Self::Sum => {
                for gx in input_grads[0].iter_mut() {
                    *gx += grad[0];
                }
            }
            Self::MaxScalar => input_grads[0][cache.argmax] += grad[0],
            Self::ScalarToVector => {
                let mut sum: TensorFloat = 0.0;
                for dy in grad {
                    sum += dy;
                }
                input_grads[0][0] += sum;
            }
            Self::Dropout { .. } => {
                for ((gx, &dy), &m) in input_grads[0].iter_mut().zip(grad).zip(&cache.mask) {
                    *gx += dy * m;
                }
            }
        }
    }
}

fn scalar_output(op: &'static str, dim: usize) -> Result<()> {
    if dim == 1 {
        Ok(())
    } else {
        Err(GraphError::InvalidDimension {
            op,
            dim,
            reason: "output must be a scalar",
        })
    }
}

/// Index and value of the first maximum element.
pub(crate) fn first_max(xs: &[TensorFloat]) -> (usize, TensorFloat) {
    let mut index = 0;
    let mut max = xs[0];
    for (i, &x) in xs.iter().enumerate().skip(1) {
        if x > max {
            max = x;
            index = i;
        }
    }
    (index, max)
}

/// Number of positions a training-mode dropout zeroes: `floor(dim * rate)`.
pub fn dropout_zero_count(dim: usize, rate: f32) -> usize {
    (dim as f32 * rate).floor() as usize
}

/// Builds a dropout mask.
///
/// Training mode zeroes exactly [`dropout_zero_count`] positions chosen
/// uniformly without replacement; inference mode scales every position by
/// `1 - rate`.
pub fn dropout_mask<R: Rng + ?Sized>(dim: usize, rate: f32, training: bool, rng: &mut R) -> Vec<TensorFloat> {
    if !training {
        return vec![1.0 - rate; dim];
    }
    let mut mask = vec![1.0; dim];
    for i in rand::seq::index::sample(rng, dim, dropout_zero_count(dim, rate)) {
        mask[i] = 0.0;
    }
    mask
}

/// Per-instance state produced by forward and consumed by backward.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeCache {
    /// Argmax of a max-scalar node.
    pub argmax: usize,
    /// Mask of a dropout node.
    pub mask: Vec<TensorFloat>,
}

/// Lifecycle of a node inside its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Linked and registered; value not computed yet.
    Registered,
    /// Value computed; gradient not yet propagated to the inputs.
    Computed,
    /// Gradient propagated to the inputs in the current backward pass.
    Differentiated,
}

/// What a caller hands to [`Graph::add_node`](crate::graph::Graph::add_node).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub op: Op,
    pub dim: usize,
    pub inputs: Vec<NodeId>,
    /// Initial value; required for [`Op::Input`], ignored otherwise.
    pub value: Option<Vec<TensorFloat>>,
}

impl NodeSpec {
    /// An operator node over `inputs`.
    pub fn new(op: Op, dim: usize, inputs: &[NodeId]) -> Self {
        Self {
            op,
            dim,
            inputs: inputs.to_vec(),
            value: None,
        }
    }

    /// A leaf holding `values`.
    pub fn input(values: &[TensorFloat]) -> Self {
        Self {
            op: Op::Input,
            dim: values.len(),
            inputs: Vec::new(),
            value: Some(values.to_vec()),
        }
    }
}

/// One computation vertex.
///
/// Nodes live in their graph's arena; inputs and parents are arena handles,
/// never owning references.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) op: Op,
    pub(crate) dim: usize,
    pub(crate) in_dims: Vec<usize>,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) parents: Vec<NodeId>,
    pub(crate) depth: usize,
    pub(crate) signature: String,
    pub(crate) value: Tensor<TensorFloat>,
    pub(crate) grad: Option<Tensor<TensorFloat>>,
    pub(crate) state: NodeState,
    pub(crate) cache: NodeCache,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn op(&self) -> Op {
        self.op
    }

    /// Operator tag, e.g. `"tanh"`.
    pub fn kind(&self) -> &'static str {
        self.op.name()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Nodes that consume this one.
    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    /// Topological level: 0 for leaves, otherwise one more than the deepest input.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn type_signature(&self) -> &str {
        &self.signature
    }

    /// See [`Op::type_equal`].
    ///
    /// # Errors
    ///
    /// Propagates [`GraphError::TrainingModeMismatch`].
    pub fn type_equal(&self, other: &Node) -> Result<bool> {
        if self.signature != other.signature {
            return Ok(false);
        }
        self.op.type_equal(&other.op, &self.signature)
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_computed(&self) -> bool {
        self.state != NodeState::Registered
    }

    pub fn value(&self) -> &Tensor<TensorFloat> {
        &self.value
    }

    pub fn grad(&self) -> Option<&Tensor<TensorFloat>> {
        self.grad.as_ref()
    }

    /// Argmax cached by a computed max-scalar node.
    pub fn argmax(&self) -> Option<usize> {
        (self.op == Op::MaxScalar && self.is_computed()).then_some(self.cache.argmax)
    }

    /// Mask drawn by a computed dropout node.
    pub fn dropout_mask(&self) -> Option<&[TensorFloat]> {
        match self.op {
            Op::Dropout { .. } if self.is_computed() => Some(&self.cache.mask),
            _ => None,
        }
    }

    /// An executor for this node's operator, seeded with this node.
    pub fn generate(&self) -> Executor {
        Executor::new(self.op, self.signature.clone(), vec![self.id])
    }

    pub(crate) fn grad_mut(&mut self) -> &mut Tensor<TensorFloat> {
        let shape = self.value.shape.clone();
        self.grad.get_or_insert_with(|| Tensor::zeros(shape))
    }
}
