//! Parallel CPU batched kernels
//!
//! # CPU Backend
//!
//! [`CpuKernels`] runs one staged batch per call, parallel over members (or
//! over elements, for elementwise operators) with [`rayon`](https://docs.rs/rayon).
//! It is what `Accelerated` mode uses when no device is available, and the
//! fallback when a device kernel fails.
//!
//! ## Design Goals
//!
//! - Deterministic results: every reduction sums one member sequentially,
//!   in index order, exactly like the scalar reference
//! - No shared mutable state: each rayon task owns its output chunk
//! - Backward writes contributions, it never reads `input_grads`

use super::{BackwardBatch, ForwardBatch, KernelError, Kernels};
use crate::node::{Activation, Op};
use crate::tensors::TensorFloat;
use rayon::prelude::*;

/// Rayon implementation of every batched operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuKernels;

impl Kernels for CpuKernels {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn forward(&self, op: Op, batch: &mut ForwardBatch) -> Result<(), KernelError> {
        let ForwardBatch {
            dim,
            in_dims,
            inputs,
            mask,
            output,
            argmax,
            ..
        } = batch;
        let dim = *dim;

        match op {
            Op::Input => return Err(KernelError::Unsupported { op: op.name() }),
            Op::Activation(a) => activation_forward(a, &inputs[0], output),
            Op::PointDot => {
                let n = in_dims[0];
                output
                    .par_iter_mut()
                    .zip(inputs[0].par_chunks(n).zip(inputs[1].par_chunks(n)))
                    .for_each(|(y, (a, b))| *y = dot(a, b));
            }
            Op::PointMul => output
                .par_iter_mut()
                .zip(inputs[0].par_iter().zip(inputs[1].par_iter()))
                .for_each(|(y, (a, b))| *y = a * b),
            Op::Add { .. } => {
                let slots: &[Vec<TensorFloat>] = inputs;
                output.par_iter_mut().enumerate().for_each(|(i, y)| {
                    let mut acc: TensorFloat = 0.0;
                    for slot in slots {
                        acc += slot[i];
                    }
                    *y = acc;
                });
            }
            Op::Sum => output
                .par_iter_mut()
                .zip(inputs[0].par_chunks(in_dims[0]))
                .for_each(|(y, row)| {
                    let mut acc: TensorFloat = 0.0;
                    for x in row {
                        acc += x;
                    }
                    *y = acc;
                }),
            Op::MaxScalar => output
                .par_iter_mut()
                .zip(argmax.par_iter_mut())
                .zip(inputs[0].par_chunks(in_dims[0]))
                .for_each(|((y, idx), row)| {
                    let (i, m) = row
                        .iter()
                        .enumerate()
                        .fold((0, row[0]), |best, (i, &x)| if x > best.1 { (i, x) } else { best });
                    *y = m;
                    *idx = i as u32;
                }),
            Op::ScalarToVector => output
                .par_chunks_mut(dim)
                .zip(inputs[0].par_iter())
                .for_each(|(row, &x)| row.fill(x)),
            Op::Dropout { .. } => output
                .par_iter_mut()
                .zip(inputs[0].par_iter().zip(mask.par_iter()))
                .for_each(|(y, (x, m))| *y = x * m),
        }
        Ok(())
    }

    fn backward(&self, op: Op, batch: &mut BackwardBatch) -> Result<(), KernelError> {
        let BackwardBatch {
            dim,
            in_dims,
            inputs,
            value,
            grad,
            mask,
            argmax,
            input_grads,
            ..
        } = batch;
        let dim = *dim;

        match op {
            Op::Input => return Err(KernelError::Unsupported { op: op.name() }),
            Op::Activation(a) => input_grads[0]
                .par_iter_mut()
                .zip(inputs[0].par_iter().zip(value.par_iter()))
                .zip(grad.par_iter())
                .for_each(|((gx, (&x, &y)), &dy)| *gx = dy * a.derivative(x, y)),
            Op::PointDot => {
                let n = in_dims[0];
                for (slot, other) in [(0, 1), (1, 0)] {
                    input_grads[slot]
                        .par_chunks_mut(n)
                        .zip(inputs[other].par_chunks(n))
                        .zip(grad.par_iter())
                        .for_each(|((gx, x), &dy)| {
                            for (g, &v) in gx.iter_mut().zip(x) {
                                *g = dy * v;
                            }
                        });
                }
            }
            Op::PointMul => {
                for (slot, other) in [(0, 1), (1, 0)] {
                    input_grads[slot]
                        .par_iter_mut()
                        .zip(inputs[other].par_iter().zip(grad.par_iter()))
                        .for_each(|(gx, (&x, &dy))| *gx = dy * x);
                }
            }
            Op::Add { .. } => {
                for slot in input_grads.iter_mut() {
                    slot.par_iter_mut().zip(grad.par_iter()).for_each(|(gx, &dy)| *gx = dy);
                }
            }
            Op::Sum => input_grads[0]
                .par_chunks_mut(in_dims[0])
                .zip(grad.par_iter())
                .for_each(|(gx, &dy)| gx.fill(dy)),
            Op::MaxScalar => input_grads[0]
                .par_chunks_mut(in_dims[0])
                .zip(argmax.par_iter().zip(grad.par_iter()))
                .for_each(|(gx, (&i, &dy))| gx[i as usize] = dy),
            Op::ScalarToVector => input_grads[0]
                .par_iter_mut()
                .zip(grad.par_chunks(dim))
                .for_each(|(gx, dy)| {
                    let mut acc: TensorFloat = 0.0;
                    for g in dy {
                        acc += g;
                    }
                    *gx = acc;
                }),
            Op::Dropout { .. } => input_grads[0]
                .par_iter_mut()
                .zip(grad.par_iter().zip(mask.par_iter()))
                .for_each(|(gx, (&dy, &m))| *gx = dy * m),
        }
        Ok(())
    }
}

fn activation_forward(a: Activation, x: &[TensorFloat], y: &mut [TensorFloat]) {
    y.par_iter_mut().zip(x.par_iter()).for_each(|(y, &x)| *y = a.apply(x));
}

#[inline]
fn dot(a: &[TensorFloat], b: &[TensorFloat]) -> TensorFloat {
    let mut acc: TensorFloat = 0.0;
    for (x, y) in a.iter().zip(b) {
        acc += x * y;
    }
    acc
}
