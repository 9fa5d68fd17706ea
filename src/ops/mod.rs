//! # Batched Kernels
//!
//! An executor hands a whole batch to a [`Kernels`] implementation in one call.
//! The batch is staged into contiguous, member-major buffers first, so a
//! kernel never sees the graph: it only sees `count` equally shaped problems.
//!
//! ## Submodules
//!
//! - [`cpu`]: rayon kernels, always available and the fallback for every other backend
//! - [`wgpu`] *(opt-in)*: compute shader pipelines using `wgpu`
//! - [`dispatch`]: kernel selection per execution mode, and fallback on failure
//!
//! ## Staging Layout
//!
//! Input slot `s` of member `m` lives at
//! `inputs[s][m * in_dims[s]..(m + 1) * in_dims[s]]`; outputs, gradients and
//! dropout masks use `dim` the same way. Backward kernels *write* each
//! member's contribution into the zeroed `input_grads` staging buffers; the
//! executor then adds them into the graph, which keeps fan-in correct when two
//! members share an input.
//!
//! ## Extending
//!
//! A new operator needs a variant on [`Op`], a reference rule in
//! [`crate::node`], and a case in every kernel set.

pub mod cpu;
pub mod dispatch;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use crate::node::Op;
use crate::tensors::TensorFloat;

/// Failure of a kernel collaborator.
///
/// Recoverable: [`dispatch`] logs it and reruns the batch on [`cpu::CpuKernels`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// No device could be acquired.
    #[error("kernel backend unavailable: {0}")]
    Unavailable(String),

    /// The backend has no kernel for this operator.
    #[error("no batched kernel for {op}")]
    Unsupported { op: &'static str },

    /// The staged batch exceeds a device limit.
    #[error("batch of {elements} elements exceeds the device limit of {limit}")]
    TooLarge { elements: usize, limit: usize },

    /// Submission, mapping or readback failed.
    #[error("kernel dispatch failed: {0}")]
    Dispatch(String),
}

/// A batched forward and backward implementation of every operator.
pub trait Kernels: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Fills `batch.output` (and `batch.argmax` for max-scalar).
    fn forward(&self, op: Op, batch: &mut ForwardBatch) -> Result<(), KernelError>;

    /// Fills `batch.input_grads` with each member's contribution.
    fn backward(&self, op: Op, batch: &mut BackwardBatch) -> Result<(), KernelError>;
}

/// Staged forward problem for one executor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardBatch {
    /// Number of batch members.
    pub count: usize,
    /// Output length per member.
    pub dim: usize,
    /// Input length per slot.
    pub in_dims: Vec<usize>,
    /// One buffer per input slot, `count * in_dims[s]` long.
    pub inputs: Vec<Vec<TensorFloat>>,
    /// Dropout masks, `count * dim` long; empty for other operators.
    pub mask: Vec<TensorFloat>,
    /// Results, `count * dim` long.
    pub output: Vec<TensorFloat>,
    /// Max-scalar argmax per member; empty for other operators.
    pub argmax: Vec<u32>,
}

impl ForwardBatch {
    /// Allocates staging for `count` members; inputs are pushed by the caller.
    pub fn new(op: Op, count: usize, dim: usize, in_dims: &[usize]) -> Self {
        Self {
            count,
            dim,
            in_dims: in_dims.to_vec(),
            inputs: in_dims.iter().map(|d| Vec::with_capacity(count * d)).collect(),
            mask: Vec::new(),
            output: vec![0.0; count * dim],
            argmax: if op == Op::MaxScalar { vec![0; count] } else { Vec::new() },
        }
    }

    /// Member `m`'s output.
    pub fn output(&self, m: usize) -> &[TensorFloat] {
        &self.output[m * self.dim..(m + 1) * self.dim]
    }
}

/// Staged backward problem for one executor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackwardBatch {
    pub count: usize,
    pub dim: usize,
    pub in_dims: Vec<usize>,
    /// Input values, laid out as in [`ForwardBatch::inputs`].
    pub inputs: Vec<Vec<TensorFloat>>,
    /// Forward results, `count * dim`.
    pub value: Vec<TensorFloat>,
    /// Upstream gradients, `count * dim`.
    pub grad: Vec<TensorFloat>,
    pub mask: Vec<TensorFloat>,
    pub argmax: Vec<u32>,
    /// Per-member contributions to each input slot, zero before the call.
    pub input_grads: Vec<Vec<TensorFloat>>,
}

impl BackwardBatch {
    /// Allocates staging for `count` members; the caller fills values.
    pub fn new(count: usize, dim: usize, in_dims: &[usize]) -> Self {
        Self {
            count,
            dim,
            in_dims: in_dims.to_vec(),
            inputs: in_dims.iter().map(|d| Vec::with_capacity(count * d)).collect(),
            value: Vec::with_capacity(count * dim),
            grad: Vec::with_capacity(count * dim),
            mask: Vec::new(),
            argmax: Vec::new(),
            input_grads: in_dims.iter().map(|d| vec![0.0; count * d]).collect(),
        }
    }

    /// Member `m`'s contribution to input slot `slot`.
    pub fn input_grad(&self, slot: usize, m: usize) -> &[TensorFloat] {
        let d = self.in_dims[slot];
        &self.input_grads[slot][m * d..(m + 1) * d]
    }

    /// Zeroes every contribution, e.g. before a fallback rerun.
    pub fn reset_input_grads(&mut self) {
        for slot in &mut self.input_grads {
            slot.fill(0.0);
        }
    }
}
