//! Monte Carlo engine: batched sampling until the baseline statistics
//! converge.
//!
//! ```text
//!   SimulationBackend ──(B samples, up to N in flight)──► MetricExtractor
//!                                                            │ batch, in issue order
//!                                                            ▼
//!                                              ConvergenceTracker (single writer)
//!                                                 │ Converged        │ Aborted / timeout
//!                                                 ▼                  ▼
//!                                           BaselineModel      EngineError, state dropped
//! ```

use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::backend::{SimulationBackend, SimulationConfig};
use crate::baseline::BaselineModel;
use crate::config::EngineConfig;
use crate::convergence::{BatchRecord, ConvergenceTracker, TrackerState};
use crate::error::{ConfigError, EngineError, EngineResult};
use crate::metric::{MetricExtractor, SignalMetrics};

/// Result of a converged sampling run.
#[derive(Clone, Debug)]
pub struct BaselineRun {
    pub baseline: BaselineModel,
    /// Per-batch convergence history.
    pub history: Vec<BatchRecord>,
    pub elapsed: Duration,
}

impl BaselineRun {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            batches: self.history.len(),
            samples: self.baseline.sample_count(),
            signals: self.baseline.len(),
            degenerate_signals: self.baseline.degenerate_signals().len(),
            elapsed_ms: self.elapsed.as_millis() as u64,
        }
    }
}

/// Compact description of a run, for logs and reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub batches: usize,
    pub samples: u64,
    pub signals: usize,
    pub degenerate_signals: usize,
    pub elapsed_ms: u64,
}

/// Drives a backend until the tracker converges or a cap is hit.
///
/// The engine holds no run state; each `run` owns a fresh tracker, so one
/// engine can serve several variants concurrently.
pub struct MonteCarloEngine<B> {
    backend: B,
    config: EngineConfig,
}

impl<B: SimulationBackend> MonteCarloEngine<B> {
    /// Validates the configuration before anything is sampled.
    pub fn new(backend: B, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { backend, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Sample until convergence and freeze the baseline.
    ///
    /// On abort or timeout all partial statistics are dropped and only the
    /// error is returned.
    #[instrument(skip(self, sim), fields(variant = %sim.variant, backend = self.backend.name()))]
    pub async fn run(&self, sim: &SimulationConfig) -> EngineResult<BaselineRun> {
        let started = Instant::now();
        let deadline = match self.config.timeout()? {
            Some(timeout) => Some(started.checked_add(timeout).ok_or_else(|| {
                ConfigError::invalid("timeout_secs", "deadline is beyond the clock's range")
            })?),
            None => None,
        };
        let mut tracker = ConvergenceTracker::from_config(&self.config);

        info!(
            batch_size = self.config.batch_size,
            max_batches = self.config.max_batches,
            required = self.config.consecutive_stable_batches,
            concurrency = self.config.effective_concurrency(),
            "starting monte carlo sampling"
        );

        loop {
            let index = tracker.batches() + 1;
            let batch = match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(self.timed_out(started, tracker.batches()));
                    }
                    match tokio::time::timeout_at(deadline, self.acquire_batch(sim, index)).await {
                        Ok(batch) => batch?,
                        Err(_) => return Err(self.timed_out(started, tracker.batches())),
                    }
                }
                None => self.acquire_batch(sim, index).await?,
            };

            match tracker.observe_batch(&batch)? {
                TrackerState::Sampling => {}
                TrackerState::Converged => break,
                TrackerState::Aborted => return Err(tracker.non_convergence_error()),
            }
        }

        let baseline = BaselineModel::from_tracker(&tracker, self.config.variance_floor)?
            .with_normalization(self.config.normalization);
        let run = BaselineRun {
            baseline,
            history: tracker.into_history(),
            elapsed: started.elapsed(),
        };
        let summary = run.summary();
        info!(
            batches = summary.batches,
            samples = summary.samples,
            signals = summary.signals,
            degenerate = summary.degenerate_signals,
            elapsed_ms = summary.elapsed_ms,
            "baseline frozen"
        );
        Ok(run)
    }

    /// Run several variants concurrently. Runs share nothing mutable and
    /// results come back in input order.
    pub async fn run_many(&self, sims: &[SimulationConfig]) -> Vec<EngineResult<BaselineRun>> {
        futures::future::join_all(sims.iter().map(|sim| self.run(sim))).await
    }

    /// Collect one batch of extracted samples. Backend calls overlap up to
    /// the configured concurrency; results keep issue order and the first
    /// failure cancels the rest of the batch.
    async fn acquire_batch(
        &self,
        sim: &SimulationConfig,
        batch: usize,
    ) -> EngineResult<Vec<SignalMetrics>> {
        let extractor = MetricExtractor::new(self.config.normalization);
        let metrics: Vec<SignalMetrics> = stream::iter(1..=self.config.batch_size)
            .map(|sample| async move {
                let activity = self
                    .backend
                    .run(sim)
                    .await
                    .map_err(|source| EngineError::Simulation {
                        batch,
                        sample,
                        source,
                    })?;
                extractor
                    .extract(&activity)
                    .map_err(|source| EngineError::Simulation {
                        batch,
                        sample,
                        source,
                    })
            })
            .buffered(self.config.effective_concurrency())
            .try_collect()
            .await?;

        debug!(batch, samples = metrics.len(), "batch acquired");
        Ok(metrics)
    }

    fn timed_out(&self, started: Instant, batches: usize) -> EngineError {
        let elapsed = started.elapsed();
        warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            batches,
            "sampling timed out before convergence"
        );
        EngineError::Timeout { elapsed, batches }
    }
}
