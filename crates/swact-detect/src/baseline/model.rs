//! The frozen clean-design baseline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::convergence::ConvergenceTracker;
use crate::error::{EngineError, EngineResult};
use crate::metric::Normalization;
use crate::types::SignalName;

// ── Per-signal summary ──────────────────────────────────────────────────

/// Clean-design statistics for one signal.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalBaseline {
    pub mean: f64,
    /// Unfloored sample variance.
    pub variance: f64,
    pub sample_count: u64,
}

impl SignalBaseline {
    fn validate(&self, signal: &SignalName) -> EngineResult<()> {
        if !self.mean.is_finite() {
            return Err(EngineError::InvalidBaseline(format!(
                "signal `{signal}` has non-finite mean {}",
                self.mean
            )));
        }
        if !self.variance.is_finite() || self.variance < 0.0 {
            return Err(EngineError::InvalidBaseline(format!(
                "signal `{signal}` has invalid variance {}",
                self.variance
            )));
        }
        if self.sample_count == 0 {
            return Err(EngineError::InvalidBaseline(format!(
                "signal `{signal}` has no samples"
            )));
        }
        Ok(())
    }
}

// ── Persisted form ──────────────────────────────────────────────────────

/// Flat persisted form: `{signal: [mean, variance, sample_count]}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaselineRecord(pub BTreeMap<SignalName, (f64, f64, u64)>);

impl BaselineRecord {
    /// Pretty JSON in the flat persisted layout.
    pub fn to_json_pretty(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Persistence(format!("serialization failed: {e}")))
    }

    /// Parse the flat persisted layout.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::Persistence(format!("deserialization failed: {e}")))
    }

    /// Number of signals in the record.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record holds no signals.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(SignalName, (f64, f64, u64))> for BaselineRecord {
    fn from_iter<I: IntoIterator<Item = (SignalName, (f64, f64, u64))>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ── Model ───────────────────────────────────────────────────────────────

/// Immutable statistical summary of clean-design behavior.
///
/// Only constructible from a converged tracker or a validated record, and
/// never mutated afterwards; share it across evaluations with `Arc`.
#[derive(Clone, Debug, PartialEq)]
pub struct BaselineModel {
    signals: BTreeMap<SignalName, SignalBaseline>,
    /// `(q1, q3)` per signal, present only when quartiles were tracked.
    quartiles: BTreeMap<SignalName, (f64, f64)>,
    sample_count: u64,
    variance_floor: f64,
    converged: bool,
    batches_run: Option<usize>,
    normalization: Option<Normalization>,
    degenerate: Vec<SignalName>,
}

impl BaselineModel {
    /// Freeze a converged tracker.
    pub fn from_tracker(tracker: &ConvergenceTracker, variance_floor: f64) -> EngineResult<Self> {
        if !tracker.is_converged() {
            return Err(EngineError::InvalidBaseline(format!(
                "tracker is {:?} after {} batches; a baseline needs a converged tracker",
                tracker.state(),
                tracker.batches()
            )));
        }

        let signals = tracker
            .signals()
            .map(|(name, stats)| {
                let entry = SignalBaseline {
                    mean: stats.mean(),
                    variance: stats.variance(),
                    sample_count: stats.count(),
                };
                (name.clone(), entry)
            })
            .collect();
        let quartiles = tracker
            .signals()
            .filter_map(|(name, _)| Some((name.clone(), tracker.quartiles(name.as_str())?)))
            .collect();

        let mut model = Self::build(signals, variance_floor)?;
        model.quartiles = quartiles;
        model.sample_count = tracker.samples();
        model.batches_run = Some(tracker.batches());
        Ok(model)
    }

    /// Rebuild from a persisted record. The global sample count becomes the
    /// largest per-signal count.
    pub fn from_record(record: BaselineRecord, variance_floor: f64) -> EngineResult<Self> {
        let signals: BTreeMap<_, _> = record
            .0
            .into_iter()
            .map(|(name, (mean, variance, sample_count))| {
                let entry = SignalBaseline {
                    mean,
                    variance,
                    sample_count,
                };
                (name, entry)
            })
            .collect();
        let mut model = Self::build(signals, variance_floor)?;
        model.sample_count = model
            .signals
            .values()
            .map(|s| s.sample_count)
            .max()
            .unwrap_or(0);
        Ok(model)
    }

    fn build(
        signals: BTreeMap<SignalName, SignalBaseline>,
        variance_floor: f64,
    ) -> EngineResult<Self> {
        if !variance_floor.is_finite() || variance_floor <= 0.0 {
            return Err(EngineError::InvalidBaseline(format!(
                "variance floor must be finite and positive, got {variance_floor}"
            )));
        }
        if signals.is_empty() {
            return Err(EngineError::InvalidBaseline(
                "baseline contains no signals".into(),
            ));
        }
        for (name, entry) in &signals {
            entry.validate(name)?;
        }

        let degenerate: Vec<SignalName> = signals
            .iter()
            .filter(|(_, s)| s.variance <= variance_floor)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &degenerate {
            warn!(
                signal = %name,
                variance = signals[name].variance,
                variance_floor,
                "degenerate baseline variance, scoring with variance floor"
            );
        }

        Ok(Self {
            signals,
            quartiles: BTreeMap::new(),
            sample_count: 0,
            variance_floor,
            converged: true,
            batches_run: None,
            normalization: None,
            degenerate,
        })
    }

    /// Record the normalization the baseline metrics were derived with.
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = Some(normalization);
        self
    }

    /// Raw statistics of a signal, unfloored.
    pub fn get(&self, signal: &str) -> Option<&SignalBaseline> {
        self.signals.get(signal)
    }

    /// Whether the clean design has this signal.
    pub fn contains(&self, signal: &str) -> bool {
        self.signals.contains_key(signal)
    }

    /// Baseline mean of a signal.
    pub fn mean(&self, signal: &str) -> Option<f64> {
        self.get(signal).map(|s| s.mean)
    }

    /// Scoring variance: `max(σ², variance_floor)`.
    pub fn variance(&self, signal: &str) -> Option<f64> {
        self.get(signal).map(|s| s.variance.max(self.variance_floor))
    }

    /// `(q1, q3)` of a signal, when quartiles were tracked.
    pub fn quartiles(&self, signal: &str) -> Option<(f64, f64)> {
        self.quartiles.get(signal).copied()
    }

    /// Per-signal statistics in name order.
    pub fn signals(&self) -> impl Iterator<Item = (&SignalName, &SignalBaseline)> {
        self.signals.iter()
    }

    /// Number of baseline signals.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Always false; an empty baseline cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Samples the baseline was built from.
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Floor applied by [`Self::variance`].
    pub fn variance_floor(&self) -> f64 {
        self.variance_floor
    }

    /// Always true for a constructed model.
    pub fn is_converged(&self) -> bool {
        self.converged
    }

    /// Batches the sampling run took. `None` for reloaded baselines.
    pub fn batches_run(&self) -> Option<usize> {
        self.batches_run
    }

    /// Normalization of the metrics, if recorded.
    pub fn normalization(&self) -> Option<Normalization> {
        self.normalization
    }

    /// Signals whose variance is at or below the floor.
    pub fn degenerate_signals(&self) -> &[SignalName] {
        &self.degenerate
    }

    /// Flat record for persistence. Variances are unfloored.
    pub fn to_record(&self) -> BaselineRecord {
        self.signals
            .iter()
            .map(|(name, s)| (name.clone(), (s.mean, s.variance, s.sample_count)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::{StabilityCriteria, TrackerState};
    use crate::metric::SignalMetrics;

    fn record(entries: &[(&str, f64, f64, u64)]) -> BaselineRecord {
        entries
            .iter()
            .map(|&(name, mean, var, n)| (SignalName::from(name), (mean, var, n)))
            .collect()
    }

    fn sample(values: &[(&str, f64)]) -> SignalMetrics {
        SignalMetrics {
            per_signal: values
                .iter()
                .map(|&(n, v)| (SignalName::from(n), v))
                .collect(),
            aggregate: values.iter().map(|(_, v)| v).sum(),
        }
    }

    fn tracker(max_batches: usize) -> ConvergenceTracker {
        ConvergenceTracker::new(StabilityCriteria {
            epsilon_mu: 1.0,
            epsilon_sigma: 1.0,
            consecutive_stable_batches: 1,
            max_batches,
            reservoir_capacity: Some(64),
        })
    }

    fn converged_tracker() -> ConvergenceTracker {
        let mut t = tracker(10);
        let batch = vec![
            sample(&[("a", 1.0), ("b", 5.0)]),
            sample(&[("a", 3.0), ("b", 5.0)]),
        ];
        t.observe_batch(&batch).unwrap();
        assert_eq!(t.observe_batch(&batch).unwrap(), TrackerState::Converged);
        t
    }

    #[test]
    fn freezes_converged_tracker() {
        let model = BaselineModel::from_tracker(&converged_tracker(), 1e-9).unwrap();
        assert!(model.is_converged());
        assert_eq!(model.len(), 2);
        assert_eq!(model.sample_count(), 4);
        assert_eq!(model.batches_run(), Some(2));
        assert_eq!(model.mean("a"), Some(2.0));
        assert!((model.variance("a").unwrap() - 4.0 / 3.0).abs() < 1e-12);
        assert!(model.quartiles("a").is_some());
    }

    #[test]
    fn rejects_unconverged_tracker() {
        let mut t = tracker(10);
        t.observe_batch(&[sample(&[("a", 1.0)])]).unwrap();
        let err = BaselineModel::from_tracker(&t, 1e-9).unwrap_err();
        assert!(matches!(err, EngineError::InvalidBaseline(_)));
        assert!(err.to_string().contains("Sampling"));
    }

    #[test]
    fn rejects_aborted_tracker() {
        let mut t = tracker(1);
        t.observe_batch(&[sample(&[("a", 1.0)])]).unwrap();
        assert_eq!(t.state(), TrackerState::Aborted);
        assert!(BaselineModel::from_tracker(&t, 1e-9).is_err());
    }

    #[test]
    fn variance_floor_applies_to_zero_variance() {
        let model = BaselineModel::from_tracker(&converged_tracker(), 0.25).unwrap();
        assert_eq!(model.get("b").unwrap().variance, 0.0);
        assert_eq!(model.variance("b"), Some(0.25));
        assert_eq!(model.degenerate_signals(), &[SignalName::from("b")]);
    }

    #[test]
    fn record_round_trip_keeps_flat_layout() {
        let rec = record(&[("result", 100.0, 4.0, 50)]);
        let json = serde_json::to_string(&rec).unwrap();
        assert_eq!(json, r#"{"result":[100.0,4.0,50]}"#);

        let model = BaselineModel::from_record(BaselineRecord::from_json(&json).unwrap(), 1e-9)
            .unwrap();
        assert_eq!(model.to_record(), rec);
        assert_eq!(model.sample_count(), 50);
        assert_eq!(model.batches_run(), None);
        assert!(model.quartiles("result").is_none());
    }

    #[test]
    fn record_validation() {
        let cases = [
            record(&[]),
            record(&[("a", f64::NAN, 1.0, 10)]),
            record(&[("a", 1.0, -1.0, 10)]),
            record(&[("a", 1.0, 1.0, 0)]),
        ];
        for rec in cases {
            assert!(matches!(
                BaselineModel::from_record(rec, 1e-9),
                Err(EngineError::InvalidBaseline(_))
            ));
        }
    }

    #[test]
    fn rejects_non_positive_floor() {
        let rec = record(&[("a", 1.0, 1.0, 10)]);
        assert!(BaselineModel::from_record(rec.clone(), 0.0).is_err());
        assert!(BaselineModel::from_record(rec, f64::INFINITY).is_err());
    }

    #[test]
    fn membership_lookup() {
        let model = BaselineModel::from_record(record(&[("u_core.acc", 1.0, 1.0, 10)]), 1e-9)
            .unwrap()
            .with_normalization(Normalization::Raw);
        assert!(model.contains("u_core.acc"));
        assert!(!model.contains("u_core.shadow"));
        assert_eq!(model.variance("u_core.shadow"), None);
        assert_eq!(model.normalization(), Some(Normalization::Raw));
    }

    #[test]
    fn baseline_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BaselineModel>();
    }
}
