//! The node arena.
//!
//! A [`Graph`] owns every node built for one computation, in registration
//! order. Nodes refer to each other through [`NodeId`] handles; a handle
//! carries the id of the graph that issued it, so mixing graphs is caught at
//! registration instead of silently indexing the wrong arena.
//!
//! Because a node can only reference nodes registered before it, the arena is
//! acyclic by construction and every input sits at a lower index than its
//! consumer. Depth is assigned on registration:
//!
//! ```text
//! depth(leaf) = 0
//! depth(n)    = 1 + max(depth(i) for i in inputs(n))
//! ```
//!
//! Driving forward and backward passes lives in [`crate::scheduler`].

use crate::backend::ExecutionMode;
use crate::config::GraphConfig;
use crate::error::{GraphError, Result};
use crate::executor::{ExecContext, Executor};
use crate::node::{Node, NodeCache, NodeSpec, NodeState, Op};
use crate::ops::{self, Kernels};
use crate::tensors::{Tensor, TensorFloat, WithGrad};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use rand::SeedableRng;
use rand::rngs::StdRng;

static NEXT_GRAPH: AtomicU32 = AtomicU32::new(0);

/// Handle to a node inside one specific graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    graph: u32,
    index: u32,
}

impl NodeId {
    /// Registration index inside the owning graph.
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn graph(self) -> u32 {
        self.graph
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.index)
    }
}

/// A dynamic computation graph and its execution settings.
pub struct Graph {
    id: u32,
    nodes: Vec<Node>,
    config: GraphConfig,
    kernels: Option<Box<dyn Kernels>>,
    rng: StdRng,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("nodes", &self.nodes.len())
            .field("config", &self.config)
            .field("kernels", &self.kernels.as_ref().map(|k| k.name()))
            .finish()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(GraphConfig::default())
    }
}

impl Graph {
    /// Creates an empty graph, selecting kernels for `config.mode`.
    pub fn new(config: GraphConfig) -> Self {
        let kernels = ops::dispatch::select(config.mode);
        Self::build(config, kernels)
    }

    /// Creates an empty graph that runs accelerated batches on `kernels`.
    pub fn with_kernels(config: GraphConfig, kernels: Box<dyn Kernels>) -> Self {
        Self::build(config, Some(kernels))
    }

    fn build(config: GraphConfig, kernels: Option<Box<dyn Kernels>>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let id = NEXT_GRAPH.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(graph = id, mode = %config.mode, training = config.training, "graph created");
        Self {
            id,
            nodes: Vec::new(),
            config,
            kernels,
            rng,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    /// Default dropout behaviour for nodes built by [`crate::operators::dropout`].
    pub fn is_training(&self) -> bool {
        self.config.training
    }

    /// Name of the accelerated kernel set, if any.
    pub fn kernels(&self) -> Option<&'static str> {
        self.kernels.as_ref().map(|k| k.name())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in registration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Resolves `id` to an arena index.
    ///
    /// # Errors
    /// [`GraphError::ForeignNode`] or [`GraphError::UnknownNode`].
    pub fn resolve(&self, id: NodeId) -> Result<usize> {
        if id.graph != self.id {
            return Err(GraphError::ForeignNode { node: id });
        }
        if id.index() >= self.nodes.len() {
            return Err(GraphError::UnknownNode { node: id });
        }
        Ok(id.index())
    }

    /// Looks up a node.
    ///
    /// # Errors
    /// As [`Graph::resolve`].
    pub fn try_node(&self, id: NodeId) -> Result<&Node> {
        self.resolve(id).map(|i| &self.nodes[i])
    }

    /// Looks up a node.
    ///
    /// # Panics
    /// Panics if `id` does not belong to this graph.
    #[track_caller]
    pub fn node(&self, id: NodeId) -> &Node {
        match self.try_node(id) {
            Ok(node) => node,
            Err(e) => e.abort(),
        }
    }

    /// Current value of `id`.
    ///
    /// # Panics
    /// Panics if `id` does not belong to this graph.
    #[track_caller]
    pub fn value(&self, id: NodeId) -> &[TensorFloat] {
        &self.node(id).value.data
    }

    /// Accumulated gradient of `id`, if a backward pass allocated one.
    #[track_caller]
    pub fn grad(&self, id: NodeId) -> Option<&[TensorFloat]> {
        self.node(id).grad.as_ref().map(|g| g.data.as_slice())
    }

    /// Value and gradient of `id` as a pair; `None` before the first backward pass.
    #[track_caller]
    pub fn with_grad(&self, id: NodeId) -> Option<WithGrad<Tensor<TensorFloat>>> {
        let node = self.node(id);
        node.grad.as_ref().map(|grad| WithGrad {
            value: node.value.clone(),
            grad: grad.clone(),
        })
    }

    /// Registers a leaf holding `values`.
    ///
    /// # Panics
    /// Panics if `values` is empty.
    #[track_caller]
    pub fn input(&mut self, values: &[TensorFloat]) -> NodeId {
        match self.add_node(NodeSpec::input(values)) {
            Ok(id) => id,
            Err(e) => e.abort(),
        }
    }

    /// Validates, links and registers a node.
    ///
    /// On success the node has a depth, a type signature and a zeroed value
    /// buffer, and it is listed as a parent of each of its inputs. Leaves are
    /// computed from the start.
    ///
    /// # Errors
    /// - [`GraphError::ForeignNode`]/[`GraphError::UnknownNode`] for a bad input handle
    /// - anything [`Op::init`] rejects
    /// - [`GraphError::InputDimMismatch`] for an input leaf whose values do not match `dim`
    pub fn add_node(&mut self, spec: NodeSpec) -> Result<NodeId> {
        let NodeSpec { op, dim, inputs, value } = spec;

        let mut in_dims = Vec::with_capacity(inputs.len());
        let mut depth = 0;
        for &input in &inputs {
            let node = self.try_node(input)?;
            in_dims.push(node.dim);
            depth = depth.max(node.depth + 1);
        }
        op.init(dim, &in_dims)?;

        let (value, state) = match (op, value) {
            (Op::Input, Some(values)) => {
                if values.len() != dim {
                    return Err(GraphError::InputDimMismatch {
                        op: op.name(),
                        expected: dim,
                        got: values.len(),
                    });
                }
                (Tensor::vector(values), NodeState::Computed)
            }
            (Op::Input, None) => (Tensor::zeros(vec![dim]), NodeState::Computed),
            _ => (Tensor::zeros(vec![dim]), NodeState::Registered),
        };

        let id = NodeId {
            graph: self.id,
            index: self.nodes.len() as u32,
        };
        let signature = op.signature(dim, &in_dims);
        for &input in &inputs {
            let parents = &mut self.nodes[input.index()].parents;
            if !parents.contains(&id) {
                parents.push(id);
            }
        }

        tracing::trace!(node = %id, op = op.name(), dim, depth, %signature, "registered");
        self.nodes.push(Node {
            id,
            op,
            dim,
            in_dims,
            inputs,
            parents: Vec::new(),
            depth,
            signature,
            value,
            grad: None,
            state,
            cache: NodeCache::default(),
        });
        Ok(id)
    }

    /// Dimension of `id`.
    ///
    /// # Errors
    /// As [`Graph::resolve`].
    pub fn dim(&self, id: NodeId) -> Result<usize> {
        self.try_node(id).map(Node::dim)
    }

    /// Checks the depth invariant over the whole arena.
    ///
    /// # Errors
    /// [`GraphError::Cycle`] for a node not strictly deeper than an input.
    pub fn validate(&self) -> Result<()> {
        for node in &self.nodes {
            for input in &node.inputs {
                if self.nodes[input.index()].depth >= node.depth {
                    return Err(GraphError::Cycle { node: node.id });
                }
            }
        }
        Ok(())
    }

    /// Resets every gradient buffer to zero, allocating missing ones.
    pub fn zero_grads(&mut self) {
        for node in &mut self.nodes {
            node.grad_mut().fill(0.0);
            if node.state == NodeState::Differentiated {
                node.state = NodeState::Computed;
            }
        }
    }

    /// Adds `grad` into the gradient of `id`.
    ///
    /// # Errors
    /// [`GraphError::SeedShape`] if the lengths differ, or a bad handle.
    pub fn seed_grad(&mut self, id: NodeId, grad: &[TensorFloat]) -> Result<()> {
        let index = self.resolve(id)?;
        let node = &mut self.nodes[index];
        if grad.len() != node.dim {
            return Err(GraphError::SeedShape {
                node: id,
                expected: node.dim,
                got: grad.len(),
            });
        }
        node.grad_mut().add_assign(grad);
        Ok(())
    }

    /// Runs `batch` forward as one executor.
    ///
    /// # Panics
    /// Panics on an invalid batch or a verification mismatch.
    #[track_caller]
    pub fn forward_batch(&mut self, batch: &[NodeId]) {
        if let Err(e) = self.try_forward_batch(batch) {
            e.abort()
        }
    }

    /// Fallible form of [`Graph::forward_batch`].
    ///
    /// # Errors
    /// Any [`GraphError`] raised by batch validation or execution.
    pub fn try_forward_batch(&mut self, batch: &[NodeId]) -> Result<()> {
        let executor = self.executor_for(batch)?;
        self.run_forward(&executor)
    }

    /// Runs `batch` backward as one executor, adding into the inputs' gradients.
    ///
    /// # Panics
    /// Panics on an invalid batch or a verification mismatch.
    #[track_caller]
    pub fn backward_batch(&mut self, batch: &[NodeId]) {
        if let Err(e) = self.try_backward_batch(batch) {
            e.abort()
        }
    }

    /// Fallible form of [`Graph::backward_batch`].
    ///
    /// # Errors
    /// Any [`GraphError`] raised by batch validation or execution.
    pub fn try_backward_batch(&mut self, batch: &[NodeId]) -> Result<()> {
        let executor = self.executor_for(batch)?;
        self.run_backward(&executor)
    }

    fn executor_for(&self, batch: &[NodeId]) -> Result<Executor> {
        let Some(&first) = batch.first() else {
            return Err(GraphError::BatchMismatch {
                signature: String::new(),
                reason: "empty batch".into(),
            });
        };
        let mut executor = self.try_node(first)?.generate();
        for &id in &batch[1..] {
            self.resolve(id)?;
            executor.push(id);
        }
        Ok(executor)
    }

    pub(crate) fn run_forward(&mut self, executor: &Executor) -> Result<()> {
        let Self {
            id,
            nodes,
            config,
            kernels,
            rng,
        } = self;
        let mut ctx = ExecContext {
            mode: config.mode,
            tolerance: config.tolerance,
            kernels: kernels.as_deref(),
            rng,
        };
        executor.forward(nodes, *id, &mut ctx)
    }

    pub(crate) fn run_backward(&mut self, executor: &Executor) -> Result<()> {
        let Self {
            id,
            nodes,
            config,
            kernels,
            rng,
        } = self;
        let mut ctx = ExecContext {
            mode: config.mode,
            tolerance: config.tolerance,
            kernels: kernels.as_deref(),
            rng,
        };
        executor.backward(nodes, *id, &mut ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Activation;

    #[test]
    fn depth_is_one_more_than_deepest_input() {
        let mut g = Graph::default();
        let a = g.input(&[1.0, 2.0]);
        let b = g.add_node(NodeSpec::new(Op::Activation(Activation::Tanh), 2, &[a])).unwrap();
        let c = g.add_node(NodeSpec::new(Op::PointMul, 2, &[a, b])).unwrap();
        assert_eq!(g.node(a).depth(), 0);
        assert_eq!(g.node(b).depth(), 1);
        assert_eq!(g.node(c).depth(), 2);
        assert_eq!(g.node(a).parents(), &[b, c]);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn foreign_inputs_are_rejected() {
        let mut g1 = Graph::default();
        let mut g2 = Graph::default();
        let x = g1.input(&[1.0]);
        let _ = g2.input(&[1.0]);
        let err = g2.add_node(NodeSpec::new(Op::Activation(Activation::Exp), 1, &[x]));
        assert!(matches!(err, Err(GraphError::ForeignNode { .. })));
    }

    #[test]
    fn shared_input_is_listed_once_as_parent() {
        let mut g = Graph::default();
        let a = g.input(&[1.0, 2.0]);
        let sq = g.add_node(NodeSpec::new(Op::PointMul, 2, &[a, a])).unwrap();
        assert_eq!(g.node(a).parents(), &[sq]);
    }

    #[test]
    fn seed_shape_is_checked() {
        let mut g = Graph::default();
        let a = g.input(&[1.0, 2.0]);
        assert!(matches!(g.seed_grad(a, &[1.0]), Err(GraphError::SeedShape { .. })));
        g.seed_grad(a, &[1.0, 1.0]).unwrap();
        g.seed_grad(a, &[1.0, 1.0]).unwrap();
        assert_eq!(g.grad(a), Some(&[2.0, 2.0][..]));
    }
}
