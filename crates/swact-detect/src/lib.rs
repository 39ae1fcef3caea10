//! # swact-detect
//!
//! Statistical anomaly detection over hardware switching activity.
//!
//! A clean design is sampled repeatedly through a [`SimulationBackend`]
//! until per-signal activity statistics converge. The converged statistics
//! are frozen into a [`BaselineModel`], and observations of other design
//! variants are scored against it. Signals that deviate significantly are
//! labelled by baseline membership: `PROPAGATED` for known signals,
//! `INTERNAL` for signals the clean design never had.
//!
//! ## Architecture
//!
//! ```text
//!   SimulationBackend ──► ActivitySample
//!                              │ MetricExtractor (toggles / cycles)
//!                              ▼
//!                       MonteCarloEngine ──► ConvergenceTracker (Welford, S stable batches)
//!                              │ Converged
//!                              ▼
//!                        BaselineModel ◄──► BaselineStore ({signal: [mean, variance, n]})
//!                              │
//!   ObservationRecord ──► DeviationEvaluator (z, two-sided confidence)
//!                              │
//!                              ▼
//!                       AnomalyClassifier (|z| and confidence gate, membership)
//!                              │
//!                              ▼
//!                       DetectionReport (ranked evidence + decision)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use swact_detect::{
//!     detect, AnomalyClassifier, EngineConfig, MonteCarloEngine, ObservationRecord,
//!     SimulationBackend, SimulationConfig,
//! };
//!
//! async fn example(backend: impl SimulationBackend) -> swact_detect::EngineResult<()> {
//!     let config = EngineConfig::from_yaml_file("engine.yaml")?;
//!     let classifier = AnomalyClassifier::from_config(&config)?;
//!     let engine = MonteCarloEngine::new(backend, config)?;
//!
//!     let run = engine.run(&SimulationConfig::new("clean", "clk")).await?;
//!     let observation = ObservationRecord::from_pairs("variant_a", [("u_alu.result", 0.42)]);
//!     let report = detect(&observation, &run.baseline, &classifier)?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub mod backend;
pub mod baseline;
pub mod classify;
pub mod config;
pub mod convergence;
pub mod deviation;
pub mod engine;
pub mod error;
pub mod false_positive;
pub mod metric;
pub mod report;
pub mod types;

// ── Re-exports ──────────────────────────────────────────────────────────

pub use backend::{SimulationBackend, SimulationConfig};
pub use baseline::{
    BaselineModel, BaselineRecord, BaselineStore, InMemoryBaseline, JsonFileBaseline,
    SignalBaseline,
};
pub use classify::{AnomalyClass, AnomalyClassifier};
pub use config::{EngineConfig, IqrConfig, IqrPolicy};
pub use convergence::{
    BatchRecord, ConvergenceStatus, ConvergenceTracker, RunningStats, StabilityCriteria,
    TrackerState,
};
pub use deviation::{confidence_from_z, z_score, DeviationEvaluator, DeviationRecord};
pub use engine::{BaselineRun, MonteCarloEngine, RunSummary};
pub use error::{ConfigError, ConfigResult, EngineError, EngineResult, SimulationError};
pub use false_positive::{estimate_false_positive_rate, FalsePositiveEstimate};
pub use metric::{MetricExtractor, Normalization, SignalMetrics};
pub use report::{detect, AnomalyEvidence, DetectionReport, SignalEvidence};
pub use types::{sum_toggles, ActivitySample, ObservationRecord, SignalName, VariantId};
