//! Kernel Dispatch Layer
//!
//! This module picks the kernel set for an [`ExecutionMode`] and runs staged
//! batches on it.
//!
//! Selection happens once per graph, in priority order:
//! 1. `Wgpu` (if the feature is enabled and an adapter is found)
//! 2. Falls back to [`CpuKernels`]
//!
//! A kernel that fails at run time is not fatal either: the failure is logged
//! and the same batch is rerun on [`CpuKernels`], so a flaky device degrades
//! to host speed instead of aborting a pass.

use super::cpu::CpuKernels;
use super::{BackwardBatch, ForwardBatch, KernelError, Kernels};
use crate::backend::ExecutionMode;
use crate::node::Op;

/// Kernels for `mode`, or `None` when the mode runs the scalar path.
pub fn select(mode: ExecutionMode) -> Option<Box<dyn Kernels>> {
    if !mode.is_accelerated() {
        return None;
    }

    #[cfg(feature = "wgpu")]
    {
        match super::wgpu::WgpuKernels::new() {
            Ok(kernels) => {
                tracing::debug!(%mode, backend = "wgpu", "selected kernels");
                return Some(Box::new(kernels));
            }
            Err(e) => tracing::warn!(%mode, error = %e, "wgpu unavailable, using cpu kernels"),
        }
    }

    tracing::debug!(%mode, backend = "cpu", "selected kernels");
    Some(Box::new(CpuKernels))
}

/// Runs a staged forward batch, retrying on [`CpuKernels`] if `kernels` fails.
///
/// # Errors
///
/// Only when the CPU kernels fail too, i.e. for operators with no kernel.
pub fn forward(kernels: &dyn Kernels, op: Op, batch: &mut ForwardBatch) -> Result<(), KernelError> {
    match kernels.forward(op, batch) {
        Ok(()) => Ok(()),
        Err(e) if kernels.name() != CpuKernels.name() => {
            tracing::warn!(backend = kernels.name(), op = op.name(), error = %e, "forward kernel failed, falling back to cpu");
            CpuKernels.forward(op, batch)
        }
        Err(e) => Err(e),
    }
}

/// Backward counterpart of [`forward`].
///
/// # Errors
///
/// Only when the CPU kernels fail too.
pub fn backward(kernels: &dyn Kernels, op: Op, batch: &mut BackwardBatch) -> Result<(), KernelError> {
    match kernels.backward(op, batch) {
        Ok(()) => Ok(()),
        Err(e) if kernels.name() != CpuKernels.name() => {
            tracing::warn!(backend = kernels.name(), op = op.name(), error = %e, "backward kernel failed, falling back to cpu");
            batch.reset_input_grads();
            CpuKernels.backward(op, batch)
        }
        Err(e) => Err(e),
    }
}
