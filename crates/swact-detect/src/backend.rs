//! The sample-producing collaborator.
//!
//! One `run` call produces one independent activity sample. Backends own
//! no randomness the engine relies on and must fail rather than default
//! when the clock is missing, the run had zero cycles, or the trace is
//! unreadable.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SimulationError;
use crate::types::{ActivitySample, VariantId};

/// What to simulate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub variant: VariantId,
    /// Name of the primary clock signal cycles are counted on.
    pub clock: String,
    /// Activity trace the backend reads, if it is file based.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_path: Option<PathBuf>,
    /// Backend-specific parameters (testbench, seed policy, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl SimulationConfig {
    pub fn new(variant: impl Into<VariantId>, clock: impl Into<String>) -> Self {
        Self {
            variant: variant.into(),
            clock: clock.into(),
            trace_path: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_trace(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_path = Some(path.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Produces activity samples, one per call.
#[async_trait]
pub trait SimulationBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Run one simulation and return its switching activity.
    async fn run(&self, config: &SimulationConfig) -> Result<ActivitySample, SimulationError>;
}

#[async_trait]
impl<B: SimulationBackend + ?Sized> SimulationBackend for std::sync::Arc<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn run(&self, config: &SimulationConfig) -> Result<ActivitySample, SimulationError> {
        (**self).run(config).await
    }
}
