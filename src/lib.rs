//! dynbatch: dynamic computation graphs with depth-batched execution.
//!
//! Build a graph node by node, then evaluate and differentiate it. Nodes of
//! the same kind and shape that sit at the same depth run together as one
//! batch, on the host or on an accelerator, so a graph of thousands of small
//! vectors costs a handful of kernel launches.
//!
//! # Features
//!
//! - Arena-owned nodes with typed handles ([`NodeId`]); no shared pointers
//! - Forward in ascending depth, backward in descending depth, one executor
//!   per `(depth, signature)` group
//! - Three execution modes: scalar host path, batched kernels, and batched
//!   kernels cross-checked against the scalar path
//! - rayon host kernels always available; `wgpu` kernels behind the `wgpu` feature
//!
//! # Modules
//!
//! - [`graph`]: the node arena, registration and accessors
//! - [`node`]: operators, their reference math and batching signatures
//! - [`operators`]: one factory function per operator
//! - [`scheduler`]: depth staging and the forward/backward drivers
//! - [`executor`]: batch validation, staging and verification
//! - [`ops`]: the batched kernel seam and its implementations
//! - [`backend`] and [`config`]: execution mode and graph settings
//! - [`tensors`] and [`approx`]: buffers and float comparison
//!
//! # Example
//!
//! ```rust
//! use dynbatch::{Graph, GraphConfig, ExecutionMode, operators::*};
//!
//! let mut g = Graph::new(GraphConfig::new(ExecutionMode::Accelerated).with_seed(1));
//! let a = g.input(&[1.0, 2.0, 3.0]);
//! let b = g.input(&[4.0, 5.0, 6.0]);
//! let d = point_dot(&mut g, a, b);
//! g.forward();
//! assert_eq!(g.value(d), &[32.0]);
//!
//! g.backward(&[(d, &[2.0])]);
//! assert_eq!(g.grad(a), Some(&[8.0, 10.0, 12.0][..]));
//! ```

pub mod approx;
pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod node;
pub mod operators;
pub mod ops;
pub mod scheduler;
pub mod tensors;

pub use backend::ExecutionMode;
pub use config::GraphConfig;
pub use error::{GraphError, Result};
pub use executor::Executor;
pub use graph::{Graph, NodeId};
pub use node::{Activation, Node, NodeSpec, NodeState, Op};
pub use ops::{KernelError, Kernels};
pub use scheduler::Schedule;
pub use tensors::{Tensor, WithGrad};
