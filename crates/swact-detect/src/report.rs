//! Detection reports: per-variant verdict with full per-signal evidence.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::baseline::BaselineModel;
use crate::classify::{AnomalyClass, AnomalyClassifier};
use crate::deviation::{DeviationEvaluator, DeviationRecord};
use crate::error::{EngineError, EngineResult};
use crate::types::{ObservationRecord, SignalName, VariantId};

/// One flagged signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvidence {
    pub signal: SignalName,
    pub classification: AnomalyClass,
    #[serde(with = "crate::deviation::z_serde")]
    pub z_score: f64,
    pub confidence: f64,
    pub observed: f64,
    pub baseline_mean: Option<f64>,
}

/// Deviation and label of any evaluated signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalEvidence {
    pub classification: AnomalyClass,
    #[serde(flatten)]
    pub deviation: DeviationRecord,
}

/// Verdict for one variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub variant_id: VariantId,
    pub total_toggles: u64,
    /// Flagged signals, most suspicious first.
    pub anomalies: Vec<AnomalyEvidence>,
    /// Every evaluated signal, flagged or not.
    pub evidence: BTreeMap<SignalName, SignalEvidence>,
    /// True iff at least one signal is anomalous.
    pub decision: bool,
    pub generated_at: DateTime<Utc>,
}

impl DetectionReport {
    /// Assemble a report from scored and labelled signals.
    pub fn from_parts(
        observation: &ObservationRecord,
        deviations: BTreeMap<SignalName, DeviationRecord>,
        labels: &BTreeMap<SignalName, AnomalyClass>,
    ) -> Self {
        let evidence: BTreeMap<SignalName, SignalEvidence> = deviations
            .into_iter()
            .map(|(signal, deviation)| {
                let classification = labels.get(&signal).copied().unwrap_or(AnomalyClass::None);
                (
                    signal,
                    SignalEvidence {
                        classification,
                        deviation,
                    },
                )
            })
            .collect();

        let mut anomalies: Vec<AnomalyEvidence> = evidence
            .iter()
            .filter(|(_, e)| e.classification.is_anomalous())
            .map(|(signal, e)| AnomalyEvidence {
                signal: signal.clone(),
                classification: e.classification,
                z_score: e.deviation.z_score,
                confidence: e.deviation.confidence,
                observed: e.deviation.observed,
                baseline_mean: e.deviation.baseline_mean,
            })
            .collect();
        // |z| descending, INTERNAL before PROPAGATED on ties, then by name.
        anomalies.sort_by(|a, b| {
            b.z_score
                .abs()
                .total_cmp(&a.z_score.abs())
                .then_with(|| b.classification.cmp(&a.classification))
                .then_with(|| a.signal.cmp(&b.signal))
        });

        Self {
            variant_id: observation.variant_id.clone(),
            total_toggles: observation.total_toggles,
            decision: !anomalies.is_empty(),
            anomalies,
            evidence,
            generated_at: Utc::now(),
        }
    }

    /// The most suspicious signal, if any.
    pub fn primary(&self) -> Option<&AnomalyEvidence> {
        self.anomalies.first()
    }

    pub fn internal(&self) -> impl Iterator<Item = &AnomalyEvidence> {
        self.anomalies
            .iter()
            .filter(|a| a.classification == AnomalyClass::Internal)
    }

    pub fn propagated(&self) -> impl Iterator<Item = &AnomalyEvidence> {
        self.anomalies
            .iter()
            .filter(|a| a.classification == AnomalyClass::Propagated)
    }

    pub fn signals_evaluated(&self) -> usize {
        self.evidence.len()
    }

    pub fn classification(&self, signal: &str) -> Option<AnomalyClass> {
        self.evidence.get(signal).map(|e| e.classification)
    }

    pub fn to_json_pretty(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Persistence(format!("report serialization failed: {e}")))
    }
}

impl std::fmt::Display for DetectionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verdict = if self.decision { "ANOMALOUS" } else { "CLEAN" };
        write!(
            f,
            "{}: {} ({} of {} signals flagged",
            self.variant_id,
            verdict,
            self.anomalies.len(),
            self.evidence.len()
        )?;
        if let Some(primary) = self.primary() {
            write!(
                f,
                ", primary {} {} z={:.2}",
                primary.signal, primary.classification, primary.z_score
            )?;
        }
        write!(f, ")")
    }
}

/// Score, classify and report one observation.
///
/// Observations with non-finite metrics are rejected rather than scored.
pub fn detect(
    observation: &ObservationRecord,
    baseline: &BaselineModel,
    classifier: &AnomalyClassifier,
) -> EngineResult<DetectionReport> {
    check_finite(observation)?;

    let deviations = DeviationEvaluator::new().evaluate(observation, baseline);
    let labels = classifier.classify_all(&deviations, baseline);
    let report = DetectionReport::from_parts(observation, deviations, &labels);

    info!(
        variant = %report.variant_id,
        signals = report.signals_evaluated(),
        anomalies = report.anomalies.len(),
        internal = report.internal().count(),
        decision = report.decision,
        "detection complete"
    );
    Ok(report)
}

pub(crate) fn check_finite(observation: &ObservationRecord) -> EngineResult<()> {
    match observation
        .per_signal_metric
        .iter()
        .find(|(_, v)| !v.is_finite())
    {
        Some((signal, value)) => Err(EngineError::InvalidObservation(format!(
            "signal `{signal}` in variant `{}` has non-finite metric {value}",
            observation.variant_id
        ))),
        None => Ok(()),
    }
}
