//! Anomaly classification.
//!
//! A signal is anomalous when `|z| > z_threshold` and
//! `confidence > confidence_threshold`. Anomalous signals are labelled by
//! baseline membership alone: known signals are `PROPAGATED`, unknown
//! ones are `INTERNAL`. Circuit topology is never consulted.
//!
//! An optional IQR bound `[q1 − k·IQR, q3 + k·IQR]` can be combined with
//! the gate (`and` / `or`) for signals whose baseline carries quartiles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::baseline::BaselineModel;
use crate::config::{EngineConfig, IqrConfig, IqrPolicy};
use crate::deviation::DeviationRecord;
use crate::error::{ConfigError, ConfigResult};
use crate::types::SignalName;

/// Default z-score threshold.
pub const DEFAULT_Z_THRESHOLD: f64 = 3.0;

/// Default confidence threshold.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.9;

/// Per-signal label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyClass {
    None,
    /// Known clean-design signal whose activity shifted.
    Propagated,
    /// Signal with no counterpart in the clean baseline.
    Internal,
}

impl AnomalyClass {
    pub fn is_anomalous(self) -> bool {
        self != AnomalyClass::None
    }
}

impl std::fmt::Display for AnomalyClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AnomalyClass::None => "NONE",
            AnomalyClass::Propagated => "PROPAGATED",
            AnomalyClass::Internal => "INTERNAL",
        };
        f.write_str(label)
    }
}

/// Gate plus membership classifier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnomalyClassifier {
    z_threshold: f64,
    confidence_threshold: f64,
    iqr: Option<IqrConfig>,
}

impl AnomalyClassifier {
    /// `confidence_threshold` must be in `[0, 1)` so unknown signals
    /// (confidence 1) always pass.
    pub fn new(z_threshold: f64, confidence_threshold: f64) -> ConfigResult<Self> {
        if !z_threshold.is_finite() || z_threshold < 0.0 {
            return Err(ConfigError::invalid(
                "z_threshold",
                format!("must be finite and non-negative, got {z_threshold}"),
            ));
        }
        if !(0.0..1.0).contains(&confidence_threshold) {
            return Err(ConfigError::invalid(
                "confidence_threshold",
                format!("must be in [0, 1), got {confidence_threshold}"),
            ));
        }
        Ok(Self {
            z_threshold,
            confidence_threshold,
            iqr: None,
        })
    }

    pub fn from_config(config: &EngineConfig) -> ConfigResult<Self> {
        let classifier = Self::new(config.z_threshold, config.confidence_threshold)?;
        match config.iqr {
            Some(iqr) => classifier.with_iqr(iqr),
            None => Ok(classifier),
        }
    }

    pub fn with_iqr(mut self, iqr: IqrConfig) -> ConfigResult<Self> {
        if !iqr.multiplier.is_finite() || iqr.multiplier <= 0.0 {
            return Err(ConfigError::invalid(
                "iqr.multiplier",
                format!("must be finite and positive, got {}", iqr.multiplier),
            ));
        }
        self.iqr = Some(iqr);
        Ok(self)
    }

    pub fn z_threshold(&self) -> f64 {
        self.z_threshold
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    pub fn iqr(&self) -> Option<IqrConfig> {
        self.iqr
    }

    /// The Z/confidence gate on its own.
    pub fn passes_gate(&self, deviation: &DeviationRecord) -> bool {
        deviation.abs_z() > self.z_threshold && deviation.confidence > self.confidence_threshold
    }

    /// `Some(outside)` when the IQR check applies to this signal.
    pub fn outside_iqr(
        &self,
        signal: &str,
        deviation: &DeviationRecord,
        baseline: &BaselineModel,
    ) -> Option<bool> {
        let iqr = self.iqr?;
        let (q1, q3) = baseline.quartiles(signal)?;
        let spread = q3 - q1;
        let lower = q1 - iqr.multiplier * spread;
        let upper = q3 + iqr.multiplier * spread;
        Some(deviation.observed < lower || deviation.observed > upper)
    }

    pub fn is_anomalous(
        &self,
        signal: &str,
        deviation: &DeviationRecord,
        baseline: &BaselineModel,
    ) -> bool {
        let gate = self.passes_gate(deviation);
        if !baseline.contains(signal) {
            return gate;
        }
        match (self.iqr, self.outside_iqr(signal, deviation, baseline)) {
            (Some(iqr), Some(outside)) => match iqr.policy {
                IqrPolicy::And => gate && outside,
                IqrPolicy::Or => gate || outside,
            },
            _ => gate,
        }
    }

    /// Label one signal.
    pub fn classify(
        &self,
        signal: &str,
        deviation: &DeviationRecord,
        baseline: &BaselineModel,
    ) -> AnomalyClass {
        if !self.is_anomalous(signal, deviation, baseline) {
            AnomalyClass::None
        } else if baseline.contains(signal) {
            AnomalyClass::Propagated
        } else {
            AnomalyClass::Internal
        }
    }

    /// Label every scored signal, `NONE` included.
    pub fn classify_all(
        &self,
        deviations: &BTreeMap<SignalName, DeviationRecord>,
        baseline: &BaselineModel,
    ) -> BTreeMap<SignalName, AnomalyClass> {
        deviations
            .iter()
            .map(|(signal, deviation)| {
                let class = self.classify(signal.as_str(), deviation, baseline);
                if class.is_anomalous() {
                    debug!(
                        signal = %signal,
                        z_score = deviation.z_score,
                        confidence = deviation.confidence,
                        classification = %class,
                        "signal flagged"
                    );
                }
                (signal.clone(), class)
            })
            .collect()
    }
}

impl Default for AnomalyClassifier {
    fn default() -> Self {
        Self {
            z_threshold: DEFAULT_Z_THRESHOLD,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iqr: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineRecord;
    use crate::convergence::{ConvergenceTracker, StabilityCriteria};
    use crate::deviation::DeviationEvaluator;
    use crate::metric::SignalMetrics;

    fn make_baseline() -> BaselineModel {
        let record: BaselineRecord = [
            (SignalName::from("result"), (100.0, 4.0, 50)),
            (SignalName::from("carry"), (10.0, 1.0, 50)),
        ]
        .into_iter()
        .collect();
        BaselineModel::from_record(record, 1e-9).unwrap()
    }

    /// Baseline with quartiles: `result` spans 1..=8 each batch.
    fn quartile_baseline() -> BaselineModel {
        let mut tracker = ConvergenceTracker::new(
            StabilityCriteria {
                epsilon_mu: 1.0,
                epsilon_sigma: 1.0,
                consecutive_stable_batches: 1,
                max_batches: 5,
                reservoir_capacity: None,
            }
            .with_reservoir(64),
        );
        let batch: Vec<SignalMetrics> = (1..=8)
            .map(|v| SignalMetrics {
                per_signal: [(SignalName::from("result"), v as f64)].into_iter().collect(),
                aggregate: v as f64,
            })
            .collect();
        tracker.observe_batch(&batch).unwrap();
        tracker.observe_batch(&batch).unwrap();
        BaselineModel::from_tracker(&tracker, 1e-9).unwrap()
    }

    fn classify(classifier: &AnomalyClassifier, baseline: &BaselineModel, signal: &str, x: f64) -> AnomalyClass {
        let d = DeviationEvaluator::new().evaluate_signal(signal, x, baseline);
        classifier.classify(signal, &d, baseline)
    }

    #[test]
    fn known_signal_past_gate_is_propagated() {
        let c = AnomalyClassifier::new(3.0, 0.9).unwrap();
        assert_eq!(classify(&c, &make_baseline(), "result", 108.0), AnomalyClass::Propagated);
        assert_eq!(classify(&c, &make_baseline(), "result", 92.0), AnomalyClass::Propagated);
    }

    #[test]
    fn known_signal_within_gate_is_none() {
        let c = AnomalyClassifier::new(3.0, 0.9).unwrap();
        assert_eq!(classify(&c, &make_baseline(), "result", 105.0), AnomalyClass::None);
        // Exactly at the threshold does not pass.
        assert_eq!(classify(&c, &make_baseline(), "result", 106.0), AnomalyClass::None);
    }

    #[test]
    fn unknown_signal_is_internal_regardless_of_magnitude() {
        let c = AnomalyClassifier::new(3.0, 0.9).unwrap();
        for x in [0.0, 1e-6, 1.0, 1e9] {
            assert_eq!(classify(&c, &make_baseline(), "shadow_a", x), AnomalyClass::Internal);
        }
    }

    #[test]
    fn confidence_gate_is_independent_of_z() {
        // z = 2.5 passes a z threshold of 2 but its confidence (~0.988) fails 0.99.
        let c = AnomalyClassifier::new(2.0, 0.99).unwrap();
        assert_eq!(classify(&c, &make_baseline(), "result", 105.0), AnomalyClass::None);
        let c = AnomalyClassifier::new(2.0, 0.98).unwrap();
        assert_eq!(classify(&c, &make_baseline(), "result", 105.0), AnomalyClass::Propagated);
    }

    #[test]
    fn rejects_invalid_thresholds() {
        assert!(AnomalyClassifier::new(3.0, 1.0).is_err());
        assert!(AnomalyClassifier::new(-1.0, 0.5).is_err());
        assert!(AnomalyClassifier::new(f64::NAN, 0.5).is_err());
        let iqr = IqrConfig {
            multiplier: 0.0,
            policy: IqrPolicy::And,
        };
        assert!(AnomalyClassifier::default().with_iqr(iqr).is_err());
    }

    #[test]
    fn iqr_and_policy_requires_both() {
        let baseline = quartile_baseline();
        let (q1, q3) = baseline.quartiles("result").unwrap();
        assert!((q1 - 2.75).abs() < 1e-9 && (q3 - 6.25).abs() < 1e-9);

        let c = AnomalyClassifier::new(1.0, 0.5)
            .unwrap()
            .with_iqr(IqrConfig {
                multiplier: 1.5,
                policy: IqrPolicy::And,
            })
            .unwrap();
        // z ≈ 2.1 passes the gate but 9.5 is inside [-2.5, 11.5].
        assert_eq!(classify(&c, &baseline, "result", 9.5), AnomalyClass::None);
        assert_eq!(classify(&c, &baseline, "result", 12.0), AnomalyClass::Propagated);
    }

    #[test]
    fn iqr_or_policy_accepts_either() {
        let baseline = quartile_baseline();
        let c = AnomalyClassifier::new(100.0, 0.5)
            .unwrap()
            .with_iqr(IqrConfig {
                multiplier: 1.5,
                policy: IqrPolicy::Or,
            })
            .unwrap();
        assert_eq!(classify(&c, &baseline, "result", 12.0), AnomalyClass::Propagated);
        assert_eq!(classify(&c, &baseline, "result", 8.0), AnomalyClass::None);
    }

    #[test]
    fn iqr_is_skipped_without_quartiles() {
        let c = AnomalyClassifier::new(3.0, 0.9)
            .unwrap()
            .with_iqr(IqrConfig::default())
            .unwrap();
        let baseline = make_baseline();
        let d = DeviationEvaluator::new().evaluate_signal("result", 108.0, &baseline);
        assert_eq!(c.outside_iqr("result", &d, &baseline), None);
        assert_eq!(c.classify("result", &d, &baseline), AnomalyClass::Propagated);
    }

    #[test]
    fn unknown_signal_stays_internal_under_iqr() {
        let c = AnomalyClassifier::new(3.0, 0.9)
            .unwrap()
            .with_iqr(IqrConfig::default())
            .unwrap();
        assert_eq!(classify(&c, &quartile_baseline(), "shadow_a", 1.0), AnomalyClass::Internal);
    }

    #[test]
    fn classify_all_keeps_none_labels() {
        let baseline = make_baseline();
        let obs = crate::types::ObservationRecord::from_pairs(
            "v",
            [("result", 100.0), ("carry", 20.0), ("shadow_a", 3.0)],
        );
        let devs = DeviationEvaluator::new().evaluate(&obs, &baseline);
        let labels = AnomalyClassifier::default().classify_all(&devs, &baseline);
        assert_eq!(labels["result"], AnomalyClass::None);
        assert_eq!(labels["carry"], AnomalyClass::Propagated);
        assert_eq!(labels["shadow_a"], AnomalyClass::Internal);
    }

    #[test]
    fn class_serializes_in_upper_case() {
        assert_eq!(
            serde_json::to_string(&AnomalyClass::Propagated).unwrap(),
            "\"PROPAGATED\""
        );
        assert_eq!(AnomalyClass::Internal.to_string(), "INTERNAL");
    }
}
