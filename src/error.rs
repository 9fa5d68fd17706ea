//! Construction, batching and verification errors.
//!
//! Every condition in here is a bug in graph assembly or in a kernel, never a
//! transient runtime state. Fallible internals return [`GraphError`] so the
//! condition can be named and tested; the driving API escalates it through
//! [`GraphError::abort`], which logs and panics with the diagnostic.

use crate::graph::NodeId;
use crate::ops::KernelError;

/// Every structural inconsistency the engine can detect.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Output or input dimensionality is structurally invalid for the operator.
    #[error("{op}: invalid dimension {dim} ({reason})")]
    InvalidDimension {
        op: &'static str,
        dim: usize,
        reason: &'static str,
    },

    /// Two inputs (or an input and the output) disagree on length.
    #[error("{op}: input dimension mismatch, expected {expected}, got {got}")]
    InputDimMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// Wrong number of inputs for the operator.
    #[error("{op}: expected {expected} inputs, got {got}")]
    Arity {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// Dropout rate outside `[0, 1)`.
    #[error("dropout: rate {0} is outside [0, 1)")]
    InvalidRate(f32),

    /// An input was registered in a different graph.
    #[error("{node} belongs to another graph")]
    ForeignNode { node: NodeId },

    /// An input id does not name a registered node.
    #[error("{node} is not registered in this graph")]
    UnknownNode { node: NodeId },

    /// A node does not sit strictly deeper than all of its inputs.
    #[error("dependency cycle through {node}")]
    Cycle { node: NodeId },

    /// Equal signatures, unequal training flags.
    #[error("batch `{signature}` mixes training and inference dropout")]
    TrainingModeMismatch { signature: String },

    /// A batch whose members cannot run as one vectorized call.
    #[error("batch `{signature}` is malformed: {reason}")]
    BatchMismatch { signature: String, reason: String },

    /// Backward or a dependent forward reached a node with no value yet.
    #[error("{node} has not been computed")]
    NotComputed { node: NodeId },

    /// An upstream gradient seed does not match the node's dimension.
    #[error("gradient seed for {node} has length {got}, node dimension is {expected}")]
    SeedShape {
        node: NodeId,
        expected: usize,
        got: usize,
    },

    /// The accelerated result disagrees with the scalar reference.
    #[error(
        "{stage} verification failed for {op} at {node}[{index}]: accelerated {got}, reference {expected}"
    )]
    VerificationMismatch {
        stage: &'static str,
        op: &'static str,
        node: NodeId,
        index: usize,
        expected: f32,
        got: f32,
    },

    /// The kernel collaborator failed and no fallback could run the batch.
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl GraphError {
    /// Logs the error and aborts the current pass.
    ///
    /// # Panics
    ///
    /// Always.
    #[track_caller]
    pub fn abort(self) -> ! {
        tracing::error!(error = %self, "fatal graph error");
        panic!("{self}")
    }
}

/// Result alias used by the fallible internals.
pub type Result<T> = core::result::Result<T, GraphError>;

/// Unwraps a [`Result`], aborting on error.
pub(crate) trait OrAbort<T> {
    fn or_abort(self) -> T;
}

impl<T> OrAbort<T> for Result<T> {
    #[track_caller]
    fn or_abort(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => e.abort(),
        }
    }
}
