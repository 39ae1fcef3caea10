use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::convergence::TrackerState;

/// Configuration problems, raised before any sampling begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key: {0}")]
    Missing(String),

    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: String, reason: String },

    #[error("configuration parse error: {0}")]
    Parse(String),

    #[error("cannot read configuration file {path}: {reason}")]
    Io { path: PathBuf, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// A backend failed to produce a valid activity sample.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("clock signal `{clock}` not found in activity trace")]
    MissingClock { clock: String },

    #[error("activity sample reports zero clock cycles ({context})")]
    ZeroCycles { context: String },

    #[error("activity trace unavailable at {path}: {reason}")]
    TraceUnavailable { path: PathBuf, reason: String },

    #[error("malformed activity trace at {path}: {reason}")]
    MalformedTrace { path: PathBuf, reason: String },

    #[error("simulation backend failed: {0}")]
    Backend(String),
}

/// Errors from the sampling, baseline and evaluation pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("simulation failed in batch {batch}, sample {sample}: {source}")]
    Simulation {
        batch: usize,
        sample: usize,
        #[source]
        source: SimulationError,
    },

    #[error(
        "no convergence after {batches} batches ({samples} samples): \
         {stable_batches}/{required} consecutive stable batches, \
         last max delta mu={last_delta_mu:.3e}, last max delta sigma2={last_delta_sigma:.3e}"
    )]
    NonConvergence {
        batches: usize,
        samples: u64,
        stable_batches: usize,
        required: usize,
        last_delta_mu: f64,
        last_delta_sigma: f64,
    },

    #[error("sampling timed out after {elapsed:?} with {batches} batches completed")]
    Timeout { elapsed: Duration, batches: usize },

    #[error("convergence tracker is {state:?} and accepts no further batches")]
    TrackerClosed { state: TrackerState },

    #[error("batch {batch} contains no samples")]
    EmptyBatch { batch: usize },

    #[error("invalid baseline: {0}")]
    InvalidBaseline(String),

    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Whether the run stopped without converging, by batch cap or by timeout.
    pub fn is_non_convergence(&self) -> bool {
        matches!(
            self,
            EngineError::NonConvergence { .. } | EngineError::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Convenience alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;
