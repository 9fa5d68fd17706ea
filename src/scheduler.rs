//! Depth-staged batch scheduling.
//!
//! # Scheduling
//!
//! A pass groups the nodes it touches by depth, then within each depth by
//! type signature. Each `(depth, signature)` group becomes one [`Executor`].
//!
//! - Forward visits depths in ascending order, so every input is computed
//!   before any node that reads it.
//! - Backward visits depths in descending order, so a node's gradient has
//!   received every parent's contribution before it propagates further.
//!
//! Nodes at the same depth never depend on each other, so any same-depth
//! group is a valid batch. Buckets keep first-appearance order, which makes
//! the schedule (and therefore every floating point accumulation order)
//! deterministic for a given registration order.

use crate::error::{GraphError, OrAbort, Result};
use crate::executor::Executor;
use crate::graph::{Graph, NodeId};
use crate::node::{Node, NodeState, Op};
use crate::tensors::TensorFloat;
use rustc_hash::FxHashMap;

/// Nodes of one signature at one depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub signature: String,
    pub batch: Vec<NodeId>,
}

/// All buckets at one depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Level {
    pub depth: usize,
    pub buckets: Vec<Bucket>,
}

/// An ordered list of levels, ascending by depth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    pub levels: Vec<Level>,
}

impl Schedule {
    /// Buckets every non-leaf node accepted by `include`.
    pub fn plan<'a>(nodes: impl IntoIterator<Item = &'a Node>, include: impl Fn(&Node) -> bool) -> Self {
        let mut by_depth: Vec<(Vec<Bucket>, FxHashMap<&'a str, usize>)> = Vec::new();
        for node in nodes {
            if node.op() == Op::Input || !include(node) {
                continue;
            }
            let depth = node.depth();
            if by_depth.len() <= depth {
                by_depth.resize_with(depth + 1, Default::default);
            }
            let (buckets, index) = &mut by_depth[depth];
            match index.get(node.type_signature()) {
                Some(&b) => buckets[b].batch.push(node.id()),
                None => {
                    index.insert(node.type_signature(), buckets.len());
                    buckets.push(Bucket {
                        signature: node.type_signature().to_string(),
                        batch: vec![node.id()],
                    });
                }
            }
        }

        let levels = by_depth
            .into_iter()
            .enumerate()
            .filter(|(_, (buckets, _))| !buckets.is_empty())
            .map(|(depth, (buckets, _))| Level { depth, buckets })
            .collect();
        Self { levels }
    }

    /// Number of executors the schedule runs.
    pub fn batch_count(&self) -> usize {
        self.levels.iter().map(|l| l.buckets.len()).sum()
    }

    /// Number of nodes the schedule covers.
    pub fn node_count(&self) -> usize {
        self.levels
            .iter()
            .flat_map(|l| &l.buckets)
            .map(|b| b.batch.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

impl Graph {
    /// Schedule for the next [`Graph::forward`]: every node not yet computed.
    pub fn plan(&self) -> Schedule {
        Schedule::plan(self.nodes(), |n| n.state() == NodeState::Registered)
    }

    /// Computes every pending node, one batch per `(depth, signature)`.
    ///
    /// Already computed nodes are left alone, so calling this again after
    /// adding nodes only evaluates the new ones.
    ///
    /// # Panics
    /// Panics on a batch validation or verification failure.
    #[track_caller]
    pub fn forward(&mut self) {
        self.try_forward().or_abort();
    }

    /// Fallible form of [`Graph::forward`].
    ///
    /// # Errors
    /// The first [`GraphError`] raised by any executor.
    pub fn try_forward(&mut self) -> Result<()> {
        self.validate()?;
        let schedule = self.plan();
        tracing::debug!(
            levels = schedule.levels.len(),
            batches = schedule.batch_count(),
            nodes = schedule.node_count(),
            "forward"
        );
        for level in &schedule.levels {
            for bucket in &level.buckets {
                let executor = self.bucket_executor(bucket)?;
                tracing::debug!(
                    depth = level.depth,
                    signature = %bucket.signature,
                    batch = bucket.batch.len(),
                    path = self.path(),
                    "forward stage"
                );
                self.run_forward(&executor)?;
            }
        }
        Ok(())
    }

    /// Full backward pass.
    ///
    /// Zeroes every gradient, adds each `(node, upstream)` seed, then
    /// propagates through every non-leaf node by descending depth. Seeding
    /// the same node twice adds both seeds.
    ///
    /// # Panics
    /// Panics if any node is still uncomputed, a seed has the wrong length,
    /// or a batch fails validation or verification.
    #[track_caller]
    pub fn backward(&mut self, seeds: &[(NodeId, &[TensorFloat])]) {
        self.try_backward(seeds).or_abort();
    }

    /// Fallible form of [`Graph::backward`].
    ///
    /// # Errors
    /// [`GraphError::NotComputed`] for a pending node, otherwise as
    /// [`Graph::seed_grad`] and the executors.
    pub fn try_backward(&mut self, seeds: &[(NodeId, &[TensorFloat])]) -> Result<()> {
        if let Some(node) = self.nodes().iter().find(|n| !n.is_computed()) {
            return Err(GraphError::NotComputed { node: node.id() });
        }
        for &(id, _) in seeds {
            self.resolve(id)?;
        }
        self.validate()?;

        self.zero_grads();
        for &(id, grad) in seeds {
            self.seed_grad(id, grad)?;
        }

        let schedule = Schedule::plan(self.nodes(), |_| true);
        tracing::debug!(
            levels = schedule.levels.len(),
            batches = schedule.batch_count(),
            seeds = seeds.len(),
            "backward"
        );
        for level in schedule.levels.iter().rev() {
            for bucket in &level.buckets {
                let executor = self.bucket_executor(bucket)?;
                tracing::debug!(
                    depth = level.depth,
                    signature = %bucket.signature,
                    batch = bucket.batch.len(),
                    path = self.path(),
                    "backward stage"
                );
                self.run_backward(&executor)?;
            }
        }
        Ok(())
    }

    fn bucket_executor(&self, bucket: &Bucket) -> Result<Executor> {
        let first = self.try_node(bucket.batch[0])?;
        Ok(Executor::new(first.op(), bucket.signature.clone(), bucket.batch.clone()))
    }

    fn path(&self) -> &'static str {
        match self.kernels() {
            Some(name) if self.mode().is_accelerated() => name,
            _ => "scalar",
        }
    }
}
