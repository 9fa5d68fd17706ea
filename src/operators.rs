//! Operator factories.
//!
//! One function per operator. Each derives the output dimension from its
//! inputs, registers the node with the graph, and returns its handle:
//!
//! ```rust
//! use dynbatch::{Graph, operators::{point_dot, tanh}};
//!
//! let mut g = Graph::default();
//! let x = g.input(&[0.1, 0.2, 0.3]);
//! let w = g.input(&[1.0, -1.0, 0.5]);
//! let h = tanh(&mut g, x);
//! let y = point_dot(&mut g, h, w);
//! g.forward();
//! assert_eq!(g.value(y).len(), 1);
//! ```
//!
//! Construction errors (foreign inputs, mismatched lengths, a dropout rate
//! outside `[0, 1)`) are programming errors and abort with a diagnostic. Use
//! [`Graph::add_node`] directly to get them as a [`Result`](crate::error::Result).

use crate::error::OrAbort;
use crate::graph::{Graph, NodeId};
use crate::node::{Activation, NodeSpec, Op};
use crate::tensors::TensorFloat;

#[track_caller]
fn register(graph: &mut Graph, op: Op, dim: usize, inputs: &[NodeId]) -> NodeId {
    graph.add_node(NodeSpec::new(op, dim, inputs)).or_abort()
}

#[track_caller]
fn dim_of(graph: &Graph, id: NodeId) -> usize {
    graph.dim(id).or_abort()
}

/// A leaf holding `values`.
#[track_caller]
pub fn input(graph: &mut Graph, values: &[TensorFloat]) -> NodeId {
    graph.input(values)
}

/// Elementwise activation `a(x)`.
#[track_caller]
pub fn activation(graph: &mut Graph, a: Activation, x: NodeId) -> NodeId {
    let dim = dim_of(graph, x);
    register(graph, Op::Activation(a), dim, &[x])
}

/// Elementwise `tanh(x)`.
#[track_caller]
pub fn tanh(graph: &mut Graph, x: NodeId) -> NodeId {
    activation(graph, Activation::Tanh, x)
}

/// Elementwise logistic sigmoid.
#[track_caller]
pub fn sigmoid(graph: &mut Graph, x: NodeId) -> NodeId {
    activation(graph, Activation::Sigmoid, x)
}

/// Elementwise `max(x, 0)`.
#[track_caller]
pub fn relu(graph: &mut Graph, x: NodeId) -> NodeId {
    activation(graph, Activation::Relu, x)
}

/// Elementwise `e^x`.
#[track_caller]
pub fn exp(graph: &mut Graph, x: NodeId) -> NodeId {
    activation(graph, Activation::Exp, x)
}

/// Dot product of two equal-length vectors.
///
/// # Panics
/// Panics if the lengths differ.
#[track_caller]
pub fn point_dot(graph: &mut Graph, a: NodeId, b: NodeId) -> NodeId {
    register(graph, Op::PointDot, 1, &[a, b])
}

/// Elementwise product.
///
/// # Panics
/// Panics if the lengths differ.
#[track_caller]
pub fn point_mul(graph: &mut Graph, a: NodeId, b: NodeId) -> NodeId {
    let dim = dim_of(graph, a);
    register(graph, Op::PointMul, dim, &[a, b])
}

/// Elementwise sum of one or more equal-length vectors.
///
/// # Panics
/// Panics if `inputs` is empty or the lengths differ.
#[track_caller]
pub fn add(graph: &mut Graph, inputs: &[NodeId]) -> NodeId {
    let dim = match inputs.first() {
        Some(&first) => dim_of(graph, first),
        None => 1,
    };
    register(graph, Op::Add { arity: inputs.len() }, dim, inputs)
}

/// Sum of all elements, as a 1-vector.
#[track_caller]
pub fn vector_sum(graph: &mut Graph, x: NodeId) -> NodeId {
    register(graph, Op::Sum, 1, &[x])
}

/// Largest element, as a 1-vector. Ties resolve to the first index.
#[track_caller]
pub fn max_scalar(graph: &mut Graph, x: NodeId) -> NodeId {
    register(graph, Op::MaxScalar, 1, &[x])
}

/// Broadcasts a 1-vector to `dim` copies.
///
/// # Panics
/// Panics if `x` is not a 1-vector or `dim` is zero.
#[track_caller]
pub fn scalar_to_vector(graph: &mut Graph, dim: usize, x: NodeId) -> NodeId {
    register(graph, Op::ScalarToVector, dim, &[x])
}

/// Dropout in the graph's default mode (see [`Graph::is_training`]).
///
/// # Panics
/// Panics if `rate` is outside `[0, 1)`.
#[track_caller]
pub fn dropout(graph: &mut Graph, x: NodeId, rate: f32) -> NodeId {
    let training = graph.is_training();
    dropout_with_mode(graph, x, rate, training)
}

/// Dropout with an explicit training flag.
///
/// In training mode exactly `floor(dim * rate)` positions are zeroed on each
/// forward pass; in inference mode every element is scaled by `1 - rate`.
///
/// # Panics
/// Panics if `rate` is outside `[0, 1)`.
#[track_caller]
pub fn dropout_with_mode(graph: &mut Graph, x: NodeId, rate: f32, training: bool) -> NodeId {
    let dim = dim_of(graph, x);
    register(graph, Op::Dropout { rate, training }, dim, &[x])
}
