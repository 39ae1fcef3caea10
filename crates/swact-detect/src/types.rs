//! Core data types shared across the pipeline.
//!
//! Signals are identified by their fully-qualified hierarchical path
//! (`"u_alu.u_ctrl.state"`), kept as flat string keys. Maps are ordered
//! (`BTreeMap`) so every derived result iterates deterministically.

use std::borrow::Borrow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SimulationError;
use crate::metric::{MetricExtractor, Normalization};

// ── Signal Identification ───────────────────────────────────────────────

/// Fully-qualified name of a design signal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalName(String);

impl SignalName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hierarchical scope (everything before the last dot), if any.
    pub fn scope(&self) -> Option<&str> {
        self.0.rsplit_once('.').map(|(scope, _)| scope)
    }

    /// Leaf signal name (after the last dot).
    pub fn leaf(&self) -> &str {
        self.0.rsplit_once('.').map(|(_, leaf)| leaf).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for SignalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SignalName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SignalName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for SignalName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Identifies the design variant an observation was taken from.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariantId(String);

impl VariantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VariantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VariantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for VariantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── Activity Samples ────────────────────────────────────────────────────

/// Sum of toggle counts, saturating at `u64::MAX`.
pub fn sum_toggles<'a>(counts: impl IntoIterator<Item = &'a u64>) -> u64 {
    counts.into_iter().fold(0u64, |acc, &n| acc.saturating_add(n))
}

/// Switching activity from one simulation run.
///
/// Produced by a [`SimulationBackend`](crate::backend::SimulationBackend)
/// and treated as immutable once returned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySample {
    /// Toggles across every signal in the trace, the clock included.
    pub total_toggles: u64,
    /// Rising edges of the designated clock.
    pub cycles: u64,
    /// Toggle count per observed signal.
    pub per_signal_toggles: BTreeMap<SignalName, u64>,
}

impl ActivitySample {
    /// Build a sample whose total is the sum of the per-signal counts.
    pub fn new(cycles: u64, per_signal_toggles: BTreeMap<SignalName, u64>) -> Self {
        let total_toggles = sum_toggles(per_signal_toggles.values());
        Self {
            total_toggles,
            cycles,
            per_signal_toggles,
        }
    }

    /// Convenience constructor from `(name, toggles)` pairs.
    pub fn from_pairs<'a, I>(cycles: u64, pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        let per_signal = pairs
            .into_iter()
            .map(|(name, count)| (SignalName::from(name), count))
            .collect();
        Self::new(cycles, per_signal)
    }

    /// Override the total toggle count (e.g. when the trace also counts
    /// signals that are not reported individually).
    pub fn with_total_toggles(mut self, total_toggles: u64) -> Self {
        self.total_toggles = total_toggles;
        self
    }
}

// ── Observations ────────────────────────────────────────────────────────

/// One test-design sample to evaluate against a baseline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub variant_id: VariantId,
    pub per_signal_metric: BTreeMap<SignalName, f64>,
    /// Sum of the observation's toggle counts (0 when built from metrics only).
    #[serde(default)]
    pub total_toggles: u64,
}

impl ObservationRecord {
    pub fn new(variant_id: impl Into<VariantId>, per_signal_metric: BTreeMap<SignalName, f64>) -> Self {
        Self {
            variant_id: variant_id.into(),
            per_signal_metric,
            total_toggles: 0,
        }
    }

    /// Build an observation from `(name, metric)` pairs.
    pub fn from_pairs<'a, I>(variant_id: impl Into<VariantId>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let metrics = pairs
            .into_iter()
            .map(|(name, value)| (SignalName::from(name), value))
            .collect();
        Self::new(variant_id, metrics)
    }

    /// Derive an observation from a raw activity sample.
    pub fn from_sample(
        variant_id: impl Into<VariantId>,
        sample: &ActivitySample,
        normalization: Normalization,
    ) -> Result<Self, SimulationError> {
        let metrics = MetricExtractor::new(normalization).extract(sample)?;
        Ok(Self {
            variant_id: variant_id.into(),
            per_signal_metric: metrics.per_signal,
            total_toggles: sum_toggles(sample.per_signal_toggles.values()),
        })
    }

    pub fn with_total_toggles(mut self, total_toggles: u64) -> Self {
        self.total_toggles = total_toggles;
        self
    }

    pub fn metric(&self, signal: &str) -> Option<f64> {
        self.per_signal_metric.get(signal).copied()
    }
}
