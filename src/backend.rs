//! Execution mode selection.
//!
//! This module defines how a [`Graph`](crate::graph::Graph) executes its
//! batches. The mode is an explicit value carried by the graph's
//! [`GraphConfig`](crate::config::GraphConfig), so one binary can run all
//! three modes side by side (the test suite does exactly that).
//!
//! # Supported Modes
//!
//! - `Cpu`: every batch member runs the scalar reference path (default).
//! - `Accelerated`: one batched kernel call per executor, on `wgpu` when the
//!   feature is enabled and an adapter is found, otherwise on the rayon host
//!   kernels.
//! - `AcceleratedWithVerification`: as `Accelerated`, then every member is
//!   recomputed with the scalar path and compared.

use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;

/// Enumeration of supported execution modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ExecutionMode {
    /// Scalar per-node loop on the host (default).
    #[default]
    Cpu = 0,
    /// One batched kernel invocation per executor.
    Accelerated,
    /// Batched kernels cross-checked against the scalar path.
    AcceleratedWithVerification,
}

impl ExecutionMode {
    /// Whether batches go through the kernel collaborator.
    pub const fn is_accelerated(self) -> bool {
        !matches!(self, Self::Cpu)
    }

    /// Whether accelerated results are re-checked on the scalar path.
    pub const fn verifies(self) -> bool {
        matches!(self, Self::AcceleratedWithVerification)
    }
}

impl TryFrom<u8> for ExecutionMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Accelerated),
            2 => Ok(Self::AcceleratedWithVerification),
            other => Err(other),
        }
    }
}

/// A mode name that is not one of `cpu`, `accelerated`, `verify`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown execution mode `{0}` (expected cpu, accelerated or verify)")]
pub struct UnknownMode(pub String);

impl FromStr for ExecutionMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "0" => Ok(Self::Cpu),
            "accelerated" | "gpu" | "1" => Ok(Self::Accelerated),
            "verify" | "verification" | "accelerated-with-verification" | "2" => {
                Ok(Self::AcceleratedWithVerification)
            }
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Accelerated => "accelerated",
            Self::AcceleratedWithVerification => "verify",
        })
    }
}
