//! Deviation scoring of an observation against the baseline.
//!
//! Scores use the normal approximation: `z = (x − μ) / sqrt(max(σ², floor))`
//! and a two-sided confidence `1 − 2·(1 − Φ(|z|)) = 1 − erfc(|z|/√2)`.
//! A signal the baseline has never seen gets `z = +∞` and confidence 1.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;

use crate::baseline::BaselineModel;
use crate::types::{ObservationRecord, SignalName};

/// Per-signal deviation evidence.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviationRecord {
    /// `null` in JSON for a signal absent from the baseline.
    #[serde(with = "z_serde")]
    pub z_score: f64,
    pub confidence: f64,
    pub observed: f64,
    pub baseline_mean: Option<f64>,
    /// Floored variance used for scoring.
    pub baseline_variance: Option<f64>,
    pub in_baseline: bool,
}

impl DeviationRecord {
    /// Record for a signal absent from the baseline.
    pub fn unknown_signal(observed: f64) -> Self {
        Self {
            z_score: f64::INFINITY,
            confidence: 1.0,
            observed,
            baseline_mean: None,
            baseline_variance: None,
            in_baseline: false,
        }
    }

    /// Magnitude of the deviation, used for ranking.
    pub fn abs_z(&self) -> f64 {
        self.z_score.abs()
    }
}

/// Standard score against a (floored) variance.
pub fn z_score(observed: f64, mean: f64, variance: f64) -> f64 {
    (observed - mean) / variance.sqrt()
}

/// Two-sided confidence for a z-score, in `[0, 1]`.
pub fn confidence_from_z(z: f64) -> f64 {
    if z.is_nan() {
        return 0.0;
    }
    if z.is_infinite() {
        return 1.0;
    }
    (1.0 - erfc(z.abs() / std::f64::consts::SQRT_2)).clamp(0.0, 1.0)
}

/// Scores observations against a baseline. Stateless and pure.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviationEvaluator;

impl DeviationEvaluator {
    /// Create an evaluator.
    pub fn new() -> Self {
        Self
    }

    /// Score every signal present in the observation.
    pub fn evaluate(
        &self,
        observation: &ObservationRecord,
        baseline: &BaselineModel,
    ) -> BTreeMap<SignalName, DeviationRecord> {
        observation
            .per_signal_metric
            .iter()
            .map(|(signal, &observed)| {
                let deviation = self.evaluate_signal(signal.as_str(), observed, baseline);
                (signal.clone(), deviation)
            })
            .collect()
    }

    /// Score one signal. A signal the baseline lacks is maximally deviant.
    pub fn evaluate_signal(
        &self,
        signal: &str,
        observed: f64,
        baseline: &BaselineModel,
    ) -> DeviationRecord {
        match (baseline.mean(signal), baseline.variance(signal)) {
            (Some(mean), Some(variance)) => {
                let z = z_score(observed, mean, variance);
                DeviationRecord {
                    z_score: z,
                    confidence: confidence_from_z(z),
                    observed,
                    baseline_mean: Some(mean),
                    baseline_variance: Some(variance),
                    in_baseline: true,
                }
            }
            _ => DeviationRecord::unknown_signal(observed),
        }
    }
}

/// JSON encoding of z-scores.
///
/// Finite values are plain numbers and `+∞` is `null`. The other non-finite
/// values are the strings `"-inf"` and `"nan"`.
pub(crate) mod z_serde {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Number(f64),
        Text(String),
        Unbounded,
    }

    pub fn serialize<S>(z: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if z.is_finite() {
            serializer.serialize_f64(*z)
        } else if z.is_nan() {
            serializer.serialize_str("nan")
        } else if z.is_sign_positive() {
            serializer.serialize_none()
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Wire::deserialize(deserializer)? {
            Wire::Number(z) => Ok(z),
            Wire::Unbounded => Ok(f64::INFINITY),
            Wire::Text(text) => match text.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(D::Error::custom(format!("invalid z-score `{other}`"))),
            },
        }
    }
}
