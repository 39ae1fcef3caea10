//! Convergence tracking: incremental per-signal statistics and the
//! batch-level stopping rule.
//!
//! ```text
//! batch k ──► RunningStats per signal (Welford)
//!                │
//!                ▼
//!        Δμ = |μ_k − μ_{k−1}|, Δσ² = |σ²_k − σ²_{k−1}|
//!                │
//!        stable iff every signal has Δμ < ε_μ and Δσ² < ε_σ
//!                │
//!        S consecutive stable batches ──► Converged
//!        max_batches reached first     ──► Aborted
//! ```
//!
//! The tracker is a single-writer accumulator owned by one engine run.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::metric::SignalMetrics;
use crate::types::SignalName;

/// Most recent values kept per signal for quartile estimation.
pub const DEFAULT_RESERVOIR_CAPACITY: usize = 4096;

// ── Running statistics ──────────────────────────────────────────────────

/// Welford running mean and variance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    /// Empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one value.
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Values seen so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Running mean, 0 when empty.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (`n − 1` denominator), 0 below two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).max(0.0)
        }
    }

    /// Sample standard deviation.
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

impl FromIterator<f64> for RunningStats {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut stats = Self::new();
        for value in iter {
            stats.push(value);
        }
        stats
    }
}

// ── Tracker state ───────────────────────────────────────────────────────

/// Lifecycle of a tracker. Both non-sampling states are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Sampling,
    Converged,
    Aborted,
}

impl TrackerState {
    /// Whether the tracker accepts no more batches.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TrackerState::Sampling)
    }
}

/// Thresholds of the stopping rule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StabilityCriteria {
    pub epsilon_mu: f64,
    pub epsilon_sigma: f64,
    pub consecutive_stable_batches: usize,
    pub max_batches: usize,
    /// Values retained per signal for quartiles; `None` keeps none.
    pub reservoir_capacity: Option<usize>,
}

impl StabilityCriteria {
    /// Criteria from an engine config. Quartiles are only tracked when the
    /// IQR check is configured.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            epsilon_mu: config.epsilon_mu,
            epsilon_sigma: config.epsilon_sigma,
            consecutive_stable_batches: config.consecutive_stable_batches,
            max_batches: config.max_batches,
            reservoir_capacity: config.iqr.map(|_| DEFAULT_RESERVOIR_CAPACITY),
        }
    }

    /// Keep up to `capacity` recent values per signal for quartiles.
    pub fn with_reservoir(mut self, capacity: usize) -> Self {
        self.reservoir_capacity = Some(capacity.max(1));
        self
    }
}

/// Summary of one processed batch, kept for convergence plots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// 1-based batch index.
    pub batch: usize,
    /// Cumulative samples after this batch.
    pub samples: u64,
    /// Signals tracked after this batch.
    pub signals: usize,
    pub aggregate_mean: f64,
    pub aggregate_variance: f64,
    /// Largest Δμ over signals that had a previous estimate.
    pub max_delta_mu: Option<f64>,
    pub max_delta_sigma: Option<f64>,
    pub stable: bool,
    pub stable_streak: usize,
}

/// Point-in-time progress of a tracker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceStatus {
    pub samples: u64,
    pub batches: usize,
    pub stable_batches: usize,
    pub required: usize,
    pub state: TrackerState,
    pub last_delta_mu: Option<f64>,
    pub last_delta_sigma: Option<f64>,
}

// ── Per-signal track ────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct SignalTrack {
    stats: RunningStats,
    /// (μ, σ²) at the end of the previous batch.
    previous: Option<(f64, f64)>,
    recent: Option<VecDeque<f64>>,
}

impl SignalTrack {
    fn new(reservoir_capacity: Option<usize>) -> Self {
        Self {
            stats: RunningStats::new(),
            previous: None,
            recent: reservoir_capacity.map(VecDeque::with_capacity),
        }
    }

    fn push(&mut self, value: f64, capacity: Option<usize>) {
        self.stats.push(value);
        if let (Some(recent), Some(cap)) = (self.recent.as_mut(), capacity) {
            if recent.len() >= cap {
                recent.pop_front();
            }
            recent.push_back(value);
        }
    }
}

/// Linear-interpolated quantile of sorted data (`0 <= q <= 1`).
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64))
}

// ── Tracker ─────────────────────────────────────────────────────────────

/// Incremental statistics plus the consecutive-stability stopping rule.
#[derive(Clone, Debug)]
pub struct ConvergenceTracker {
    criteria: StabilityCriteria,
    signals: BTreeMap<SignalName, SignalTrack>,
    aggregate: RunningStats,
    state: TrackerState,
    samples: u64,
    batches: usize,
    stable_streak: usize,
    /// (max Δμ, max Δσ²) of the last `S` batches.
    recent_deltas: VecDeque<(f64, f64)>,
    history: Vec<BatchRecord>,
}

impl ConvergenceTracker {
    /// Fresh tracker in the sampling state.
    pub fn new(criteria: StabilityCriteria) -> Self {
        Self {
            criteria,
            signals: BTreeMap::new(),
            aggregate: RunningStats::new(),
            state: TrackerState::Sampling,
            samples: 0,
            batches: 0,
            stable_streak: 0,
            recent_deltas: VecDeque::with_capacity(criteria.consecutive_stable_batches),
            history: Vec::new(),
        }
    }

    /// Tracker with criteria taken from an engine config.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(StabilityCriteria::from_config(config))
    }

    /// Fold one batch of extracted samples into the statistics and apply
    /// the stopping rule.
    ///
    /// A batch is stable only if every tracked signal already had an
    /// estimate before this batch and both deltas are under their
    /// thresholds. The first batch therefore never counts as stable, and
    /// neither does a batch that introduces a new signal.
    pub fn observe_batch(&mut self, batch: &[SignalMetrics]) -> EngineResult<TrackerState> {
        if self.state.is_terminal() {
            return Err(EngineError::TrackerClosed { state: self.state });
        }
        let index = self.batches + 1;
        if batch.is_empty() {
            return Err(EngineError::EmptyBatch { batch: index });
        }

        let capacity = self.criteria.reservoir_capacity;
        for metrics in batch {
            self.samples += 1;
            self.aggregate.push(metrics.aggregate);
            for (name, &value) in &metrics.per_signal {
                self.signals
                    .entry(name.clone())
                    .or_insert_with(|| SignalTrack::new(capacity))
                    .push(value, capacity);
            }
        }
        self.batches = index;

        let mut stable = true;
        let mut max_delta_mu: Option<f64> = None;
        let mut max_delta_sigma: Option<f64> = None;
        for track in self.signals.values_mut() {
            let current = (track.stats.mean(), track.stats.variance());
            match track.previous.replace(current) {
                Some((prev_mu, prev_var)) => {
                    let d_mu = (current.0 - prev_mu).abs();
                    let d_sigma = (current.1 - prev_var).abs();
                    max_delta_mu = Some(max_delta_mu.map_or(d_mu, |m| m.max(d_mu)));
                    max_delta_sigma = Some(max_delta_sigma.map_or(d_sigma, |m| m.max(d_sigma)));
                    // NaN deltas compare false and count as unstable.
                    if !(d_mu < self.criteria.epsilon_mu && d_sigma < self.criteria.epsilon_sigma) {
                        stable = false;
                    }
                }
                None => stable = false,
            }
        }

        if stable {
            self.stable_streak += 1;
        } else {
            self.stable_streak = 0;
        }
        if let (Some(d_mu), Some(d_sigma)) = (max_delta_mu, max_delta_sigma) {
            if self.recent_deltas.len() >= self.criteria.consecutive_stable_batches {
                self.recent_deltas.pop_front();
            }
            self.recent_deltas.push_back((d_mu, d_sigma));
        }

        debug!(
            batch = index,
            samples = self.samples,
            signals = self.signals.len(),
            stable,
            stable_batches = self.stable_streak,
            max_delta_mu = ?max_delta_mu,
            max_delta_sigma = ?max_delta_sigma,
            "batch processed"
        );

        if self.stable_streak >= self.criteria.consecutive_stable_batches {
            self.state = TrackerState::Converged;
            info!(
                batches = self.batches,
                samples = self.samples,
                signals = self.signals.len(),
                "convergence reached"
            );
        } else if self.batches >= self.criteria.max_batches {
            self.state = TrackerState::Aborted;
            warn!(
                batches = self.batches,
                samples = self.samples,
                stable_batches = self.stable_streak,
                required = self.criteria.consecutive_stable_batches,
                "max_batches reached without convergence"
            );
        }

        self.history.push(BatchRecord {
            batch: index,
            samples: self.samples,
            signals: self.signals.len(),
            aggregate_mean: self.aggregate.mean(),
            aggregate_variance: self.aggregate.variance(),
            max_delta_mu,
            max_delta_sigma,
            stable,
            stable_streak: self.stable_streak,
        });

        Ok(self.state)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// Whether the stopping rule has fired.
    pub fn is_converged(&self) -> bool {
        self.state == TrackerState::Converged
    }

    /// Thresholds in use.
    pub fn criteria(&self) -> &StabilityCriteria {
        &self.criteria
    }

    /// Samples folded in so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Batches processed so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Current run of consecutive stable batches.
    pub fn stable_streak(&self) -> usize {
        self.stable_streak
    }

    /// Running statistics of one signal.
    pub fn signal_stats(&self, signal: &str) -> Option<&RunningStats> {
        self.signals.get(signal).map(|t| &t.stats)
    }

    /// Per-signal statistics in name order.
    pub fn signals(&self) -> impl Iterator<Item = (&SignalName, &RunningStats)> {
        self.signals.iter().map(|(name, track)| (name, &track.stats))
    }

    /// Running statistics of the whole-design metric.
    pub fn aggregate(&self) -> &RunningStats {
        &self.aggregate
    }

    /// `(q1, q3)` over the retained values of a signal, if quartiles are tracked.
    pub fn quartiles(&self, signal: &str) -> Option<(f64, f64)> {
        let recent = self.signals.get(signal)?.recent.as_ref()?;
        let mut sorted: Vec<f64> = recent.iter().copied().filter(|v| v.is_finite()).collect();
        sorted.sort_by(f64::total_cmp);
        Some((quantile(&sorted, 0.25)?, quantile(&sorted, 0.75)?))
    }

    /// Deltas of the most recent batches, oldest first.
    pub fn recent_deltas(&self) -> impl Iterator<Item = &(f64, f64)> {
        self.recent_deltas.iter()
    }

    /// One record per processed batch.
    pub fn history(&self) -> &[BatchRecord] {
        &self.history
    }

    /// Consume the tracker, keeping its batch history.
    pub fn into_history(self) -> Vec<BatchRecord> {
        self.history
    }

    /// Snapshot of progress and the latest deltas.
    pub fn status(&self) -> ConvergenceStatus {
        let last = self.recent_deltas.back();
        ConvergenceStatus {
            samples: self.samples,
            batches: self.batches,
            stable_batches: self.stable_streak,
            required: self.criteria.consecutive_stable_batches,
            state: self.state,
            last_delta_mu: last.map(|d| d.0),
            last_delta_sigma: last.map(|d| d.1),
        }
    }

    /// The error describing an aborted run.
    pub fn non_convergence_error(&self) -> EngineError {
        let status = self.status();
        EngineError::NonConvergence {
            batches: status.batches,
            samples: status.samples,
            stable_batches: status.stable_batches,
            required: status.required,
            last_delta_mu: status.last_delta_mu.unwrap_or(f64::NAN),
            last_delta_sigma: status.last_delta_sigma.unwrap_or(f64::NAN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria(s: usize, max_batches: usize) -> StabilityCriteria {
        StabilityCriteria {
            epsilon_mu: 2.0,
            epsilon_sigma: 30.0,
            consecutive_stable_batches: s,
            max_batches,
            reservoir_capacity: None,
        }
    }

    fn batch(values: &[f64]) -> Vec<SignalMetrics> {
        values
            .iter()
            .map(|&v| SignalMetrics {
                per_signal: [(SignalName::from("result"), v)].into_iter().collect(),
                aggregate: v,
            })
            .collect()
    }

    fn clean() -> Vec<SignalMetrics> {
        batch(&[10.0, 12.0, 10.0, 12.0])
    }

    #[test]
    fn running_stats_matches_textbook_values() {
        let stats: RunningStats = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].into_iter().collect();
        assert_eq!(stats.count(), 8);
        assert!((stats.mean() - 5.0).abs() < 1e-12);
        assert!((stats.variance() - 32.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn running_stats_small_counts() {
        let mut stats = RunningStats::new();
        assert_eq!(stats.variance(), 0.0);
        stats.push(3.0);
        assert_eq!(stats.mean(), 3.0);
        assert_eq!(stats.variance(), 0.0);
    }

    #[test]
    fn first_batch_is_never_stable() {
        let mut tracker = ConvergenceTracker::new(criteria(1, 10));
        assert_eq!(tracker.observe_batch(&clean()).unwrap(), TrackerState::Sampling);
        assert!(!tracker.history()[0].stable);
        assert_eq!(tracker.history()[0].max_delta_mu, None);
        assert_eq!(tracker.observe_batch(&clean()).unwrap(), TrackerState::Converged);
    }

    #[test]
    fn converges_after_s_consecutive_stable_batches() {
        let mut tracker = ConvergenceTracker::new(criteria(3, 10));
        let states: Vec<_> = (0..4)
            .map(|_| tracker.observe_batch(&clean()).unwrap())
            .collect();
        assert_eq!(
            states,
            vec![
                TrackerState::Sampling,
                TrackerState::Sampling,
                TrackerState::Sampling,
                TrackerState::Converged
            ]
        );
        assert_eq!(tracker.samples(), 16);
    }

    #[test]
    fn outlier_batch_resets_the_streak() {
        let mut tracker = ConvergenceTracker::new(criteria(3, 20));
        tracker.observe_batch(&clean()).unwrap();
        tracker.observe_batch(&clean()).unwrap();
        tracker.observe_batch(&clean()).unwrap();
        assert_eq!(tracker.stable_streak(), 2);

        tracker.observe_batch(&batch(&[30.0; 4])).unwrap();
        assert_eq!(tracker.stable_streak(), 0);
        assert!(!tracker.history()[3].stable);

        for _ in 0..2 {
            assert_eq!(tracker.observe_batch(&clean()).unwrap(), TrackerState::Sampling);
        }
        assert_eq!(tracker.observe_batch(&clean()).unwrap(), TrackerState::Converged);
        assert_eq!(tracker.batches(), 7);
    }

    #[test]
    fn aborts_at_max_batches() {
        let mut tracker = ConvergenceTracker::new(criteria(3, 3));
        tracker.observe_batch(&clean()).unwrap();
        tracker.observe_batch(&batch(&[50.0; 4])).unwrap();
        assert_eq!(tracker.observe_batch(&clean()).unwrap(), TrackerState::Aborted);

        match tracker.non_convergence_error() {
            EngineError::NonConvergence {
                batches, samples, required, ..
            } => {
                assert_eq!(batches, 3);
                assert_eq!(samples, 12);
                assert_eq!(required, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn convergence_wins_over_abort_on_the_last_batch() {
        let mut tracker = ConvergenceTracker::new(criteria(1, 2));
        tracker.observe_batch(&clean()).unwrap();
        assert_eq!(tracker.observe_batch(&clean()).unwrap(), TrackerState::Converged);
    }

    #[test]
    fn terminal_tracker_rejects_batches() {
        let mut tracker = ConvergenceTracker::new(criteria(1, 2));
        tracker.observe_batch(&clean()).unwrap();
        tracker.observe_batch(&clean()).unwrap();
        let err = tracker.observe_batch(&clean()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::TrackerClosed {
                state: TrackerState::Converged
            }
        ));
    }

    #[test]
    fn empty_batch_is_rejected() {
        let mut tracker = ConvergenceTracker::new(criteria(1, 2));
        assert!(matches!(
            tracker.observe_batch(&[]),
            Err(EngineError::EmptyBatch { batch: 1 })
        ));
    }

    #[test]
    fn new_signal_makes_batch_unstable() {
        let mut tracker = ConvergenceTracker::new(criteria(1, 10));
        tracker.observe_batch(&clean()).unwrap();
        let mut extended = clean();
        for m in &mut extended {
            m.per_signal.insert(SignalName::from("late"), 1.0);
        }
        assert_eq!(tracker.observe_batch(&extended).unwrap(), TrackerState::Sampling);
        assert!(!tracker.history()[1].stable);
        assert_eq!(tracker.observe_batch(&extended).unwrap(), TrackerState::Converged);
        assert_eq!(tracker.signal_stats("late").unwrap().count(), 8);
    }

    #[test]
    fn signal_seen_once_does_not_block_convergence() {
        let mut tracker = ConvergenceTracker::new(criteria(2, 10));
        let mut first = clean();
        first[0].per_signal.insert(SignalName::from("rare"), 1.0);
        assert_eq!(tracker.observe_batch(&first).unwrap(), TrackerState::Sampling);

        assert_eq!(tracker.observe_batch(&clean()).unwrap(), TrackerState::Sampling);
        assert_eq!(tracker.observe_batch(&clean()).unwrap(), TrackerState::Converged);
        assert!(tracker.history()[1].stable);
        assert_eq!(tracker.signal_stats("rare").unwrap().count(), 1);
    }

    #[test]
    fn nan_metric_is_never_stable() {
        let mut tracker = ConvergenceTracker::new(criteria(1, 3));
        tracker.observe_batch(&clean()).unwrap();
        tracker.observe_batch(&batch(&[f64::NAN])).unwrap();
        assert!(!tracker.history()[1].stable);
    }

    #[test]
    fn quartiles_follow_linear_interpolation() {
        let mut tracker = ConvergenceTracker::new(criteria(1, 10).with_reservoir(16));
        tracker.observe_batch(&batch(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        let (q1, q3) = tracker.quartiles("result").unwrap();
        assert!((q1 - 1.75).abs() < 1e-12);
        assert!((q3 - 3.25).abs() < 1e-12);
    }

    #[test]
    fn reservoir_keeps_most_recent_values() {
        let mut tracker = ConvergenceTracker::new(criteria(1, 10).with_reservoir(4));
        tracker.observe_batch(&batch(&[100.0, 100.0, 1.0, 2.0])).unwrap();
        tracker.observe_batch(&batch(&[3.0, 4.0])).unwrap();
        let (q1, q3) = tracker.quartiles("result").unwrap();
        assert!((q1 - 1.75).abs() < 1e-12);
        assert!((q3 - 3.25).abs() < 1e-12);
    }

    #[test]
    fn quartiles_absent_without_reservoir() {
        let mut tracker = ConvergenceTracker::new(criteria(1, 10));
        tracker.observe_batch(&clean()).unwrap();
        assert!(tracker.quartiles("result").is_none());
    }

    #[test]
    fn history_tracks_aggregate() {
        let mut tracker = ConvergenceTracker::new(criteria(3, 10));
        tracker.observe_batch(&clean()).unwrap();
        let rec = &tracker.history()[0];
        assert_eq!(rec.batch, 1);
        assert_eq!(rec.samples, 4);
        assert!((rec.aggregate_mean - 11.0).abs() < 1e-12);
        assert!((rec.aggregate_variance - 4.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn recent_deltas_window_is_bounded() {
        let mut tracker = ConvergenceTracker::new(criteria(2, 10));
        for _ in 0..2 {
            tracker.observe_batch(&clean()).unwrap();
        }
        tracker.observe_batch(&batch(&[40.0; 4])).unwrap();
        tracker.observe_batch(&clean()).unwrap();
        assert_eq!(tracker.recent_deltas().count(), 2);
        assert!(tracker.status().last_delta_mu.is_some());
    }
}
