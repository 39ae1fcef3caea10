//! False-alarm estimation: run clean observations through the detector and
//! count how often it flags them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::baseline::BaselineModel;
use crate::classify::AnomalyClassifier;
use crate::deviation::DeviationEvaluator;
use crate::error::{ConfigError, EngineError, EngineResult};
use crate::report::check_finite;
use crate::types::{ObservationRecord, SignalName};

/// False-positive statistics for one classifier setting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FalsePositiveEstimate {
    /// Z threshold the classifier was run with.
    pub threshold: f64,
    pub total_observations: usize,
    /// Observations with at least one flagged signal.
    pub false_positives: usize,
    pub false_positive_rate: f64,
    /// Largest finite `|z|` seen across all signals.
    pub max_abs_z: f64,
    /// Mean finite `|z|` across all scored signals.
    pub mean_abs_z: f64,
    /// How many observations flagged each signal.
    pub flagged_signals: BTreeMap<SignalName, usize>,
}

/// Evaluate clean observations against a clean baseline.
///
/// Every flagged observation is a false alarm. Signals unknown to the
/// baseline are flagged like in detection but excluded from the `|z|`
/// statistics.
pub fn estimate_false_positive_rate(
    observations: &[ObservationRecord],
    baseline: &BaselineModel,
    classifier: &AnomalyClassifier,
) -> EngineResult<FalsePositiveEstimate> {
    let threshold = classifier.z_threshold();
    if threshold <= 0.0 {
        return Err(EngineError::Config(ConfigError::invalid(
            "z_threshold",
            "false-positive estimation needs a positive threshold",
        )));
    }
    if observations.is_empty() {
        return Err(EngineError::InvalidObservation(
            "no observations provided for false-positive estimation".into(),
        ));
    }

    let evaluator = DeviationEvaluator::new();
    let mut false_positives = 0usize;
    let mut flagged_signals: BTreeMap<SignalName, usize> = BTreeMap::new();
    let mut max_abs_z = 0.0f64;
    let mut sum_abs_z = 0.0f64;
    let mut scored = 0usize;

    for observation in observations {
        check_finite(observation)?;
        let deviations = evaluator.evaluate(observation, baseline);
        let labels = classifier.classify_all(&deviations, baseline);

        let mut flagged = false;
        for (signal, class) in &labels {
            if class.is_anomalous() {
                flagged = true;
                *flagged_signals.entry(signal.clone()).or_default() += 1;
            }
        }
        if flagged {
            false_positives += 1;
        }

        for deviation in deviations.values() {
            let z = deviation.abs_z();
            if z.is_finite() {
                max_abs_z = max_abs_z.max(z);
                sum_abs_z += z;
                scored += 1;
            }
        }
    }

    let total = observations.len();
    let estimate = FalsePositiveEstimate {
        threshold,
        total_observations: total,
        false_positives,
        false_positive_rate: false_positives as f64 / total as f64,
        max_abs_z,
        mean_abs_z: if scored == 0 { 0.0 } else { sum_abs_z / scored as f64 },
        flagged_signals,
    };
    info!(
        threshold,
        observations = total,
        false_positives,
        rate = estimate.false_positive_rate,
        "false-positive estimate"
    );
    Ok(estimate)
}
