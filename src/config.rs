//! Graph configuration.
//!
//! A [`GraphConfig`] is fixed when a [`Graph`](crate::graph::Graph) is built
//! and read by every executor the graph creates. Values come from code via the
//! `with_*` setters, or from the environment via [`GraphConfig::from_env`]:
//!
//! | variable             | meaning                                   |
//! |----------------------|-------------------------------------------|
//! | `DYNBATCH_MODE`      | `cpu`, `accelerated` or `verify`          |
//! | `DYNBATCH_TRAINING`  | `true`/`false`, default dropout behaviour |
//! | `DYNBATCH_SEED`      | `u64` seed for dropout masks              |
//! | `DYNBATCH_TOLERANCE` | verification tolerance (`f32`)            |

use crate::backend::ExecutionMode;
use core::str::FromStr;

/// Default tolerance for verification mode.
pub const DEFAULT_TOLERANCE: f32 = 1e-4;

/// Execution settings shared by every node of one graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphConfig {
    /// How batches are executed.
    pub mode: ExecutionMode,
    /// Default dropout behaviour for nodes built without an explicit flag.
    pub training: bool,
    /// Relative tolerance used when comparing accelerated and scalar results.
    pub tolerance: f32,
    /// Seed for dropout masks; `None` draws from the OS.
    pub seed: Option<u64>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Cpu,
            training: true,
            tolerance: DEFAULT_TOLERANCE,
            seed: None,
        }
    }
}

impl GraphConfig {
    /// Returns a config with the given mode and defaults otherwise.
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Sets the execution mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets training (`true`) or inference (`false`) mode.
    #[must_use]
    pub const fn with_training(mut self, training: bool) -> Self {
        self.training = training;
        self
    }

    /// Sets the verification tolerance.
    #[must_use]
    pub const fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Fixes the dropout seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builds a config from `DYNBATCH_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable ones are logged and
    /// ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(mode) = parse_var(&lookup, "DYNBATCH_MODE") {
            config.mode = mode;
        }
        if let Some(training) = parse_var(&lookup, "DYNBATCH_TRAINING") {
            config.training = training;
        }
        if let Some(seed) = parse_var(&lookup, "DYNBATCH_SEED") {
            config.seed = Some(seed);
        }
        if let Some(tolerance) = parse_var::<f32>(&lookup, "DYNBATCH_TOLERANCE") {
            if tolerance.is_finite() && tolerance >= 0.0 {
                config.tolerance = tolerance;
            } else {
                tracing::warn!(tolerance, "ignoring non-finite or negative DYNBATCH_TOLERANCE");
            }
        }
        config
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring unparsable setting");
            None
        }
    }
}
