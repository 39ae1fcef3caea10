//! Engine configuration.
//!
//! One explicit structure with every option enumerated. Unknown keys are
//! rejected and required keys have no defaults, so a typo in a config file
//! fails before any sampling starts.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{ConfigError, ConfigResult};
use crate::metric::Normalization;

/// Keys that must be present in every configuration.
pub const REQUIRED_KEYS: [&str; 8] = [
    "batch_size",
    "max_batches",
    "epsilon_mu",
    "epsilon_sigma",
    "consecutive_stable_batches",
    "variance_floor",
    "z_threshold",
    "confidence_threshold",
];

/// Keys that fall back to a default when absent.
pub const OPTIONAL_KEYS: [&str; 4] = ["timeout_secs", "normalization", "sample_concurrency", "iqr"];

/// Default IQR fence multiplier (Tukey's 1.5).
pub const DEFAULT_IQR_MULTIPLIER: f64 = 1.5;

/// How the IQR bound combines with the Z/confidence gate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IqrPolicy {
    /// Anomalous only when both the gate and the IQR bound agree.
    #[default]
    And,
    /// Anomalous when either one fires.
    Or,
}

/// Secondary IQR outlier check. Disabled unless configured.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IqrConfig {
    #[serde(default = "default_iqr_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub policy: IqrPolicy,
}

fn default_iqr_multiplier() -> f64 {
    DEFAULT_IQR_MULTIPLIER
}

impl Default for IqrConfig {
    fn default() -> Self {
        Self {
            multiplier: DEFAULT_IQR_MULTIPLIER,
            policy: IqrPolicy::And,
        }
    }
}

/// Full engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Samples per batch (`B`).
    pub batch_size: usize,
    /// Hard cap on batches before the run aborts.
    pub max_batches: usize,
    /// Stability threshold on the change of the running mean.
    pub epsilon_mu: f64,
    /// Stability threshold on the change of the running variance.
    pub epsilon_sigma: f64,
    /// Consecutive stable batches required to converge (`S`).
    pub consecutive_stable_batches: usize,
    /// Lower bound applied to baseline variances when scoring.
    pub variance_floor: f64,
    pub z_threshold: f64,
    pub confidence_threshold: f64,
    /// Optional wall-clock cap on a whole sampling run, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub normalization: Normalization,
    /// Backend calls in flight per batch. Defaults to `batch_size`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iqr: Option<IqrConfig>,
}

impl EngineConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let value: Value =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        match value {
            Value::Mapping(map) => Self::from_map(map),
            Value::Null => Err(ConfigError::Missing(REQUIRED_KEYS[0].to_string())),
            other => Err(ConfigError::Parse(format!(
                "expected a mapping of configuration keys, found {}",
                value_kind(&other)
            ))),
        }
    }

    /// Load, parse and validate a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Build from an already-parsed key/value mapping.
    ///
    /// Unknown keys are reported before missing ones.
    pub fn from_map(map: Mapping) -> ConfigResult<Self> {
        for key in map.keys() {
            let name = key
                .as_str()
                .ok_or_else(|| ConfigError::Parse(format!("non-string key {key:?}")))?;
            if !REQUIRED_KEYS.contains(&name) && !OPTIONAL_KEYS.contains(&name) {
                return Err(ConfigError::UnknownKey(name.to_string()));
            }
        }
        if let Some(missing) = REQUIRED_KEYS.iter().find(|k| !map.contains_key(**k)) {
            return Err(ConfigError::Missing(missing.to_string()));
        }

        let config: EngineConfig = serde_yaml::from_value(Value::Mapping(map))
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value. Called by the loaders and by the engine constructor.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.max_batches == 0 {
            return Err(ConfigError::invalid("max_batches", "must be at least 1"));
        }
        if self.consecutive_stable_batches == 0 {
            return Err(ConfigError::invalid(
                "consecutive_stable_batches",
                "must be at least 1",
            ));
        }
        // The first batch only seeds the deltas, so S stable batches need S + 1 batches.
        if self.consecutive_stable_batches >= self.max_batches {
            return Err(ConfigError::invalid(
                "max_batches",
                format!(
                    "must exceed consecutive_stable_batches ({}) or the run can never converge",
                    self.consecutive_stable_batches
                ),
            ));
        }
        positive("epsilon_mu", self.epsilon_mu)?;
        positive("epsilon_sigma", self.epsilon_sigma)?;
        positive("variance_floor", self.variance_floor)?;

        if !self.z_threshold.is_finite() || self.z_threshold < 0.0 {
            return Err(ConfigError::invalid(
                "z_threshold",
                format!("must be finite and non-negative, got {}", self.z_threshold),
            ));
        }
        if !(0.0..1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::invalid(
                "confidence_threshold",
                format!("must be in [0, 1), got {}", self.confidence_threshold),
            ));
        }
        self.timeout()?;
        if self.sample_concurrency == Some(0) {
            return Err(ConfigError::invalid("sample_concurrency", "must be at least 1"));
        }
        if let Some(iqr) = &self.iqr {
            positive("iqr.multiplier", iqr.multiplier)?;
        }
        Ok(())
    }

    /// Wall-clock cap as a `Duration`, if configured.
    pub fn timeout(&self) -> ConfigResult<Option<Duration>> {
        let Some(secs) = self.timeout_secs else {
            return Ok(None);
        };
        positive("timeout_secs", secs)?;
        Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|e| ConfigError::invalid("timeout_secs", format!("{secs} seconds: {e}")))
    }

    /// Backend calls allowed in flight, never more than one batch.
    pub fn effective_concurrency(&self) -> usize {
        self.sample_concurrency
            .unwrap_or(self.batch_size)
            .clamp(1, self.batch_size.max(1))
    }
}

fn positive(key: &str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            key,
            format!("must be finite and positive, got {value}"),
        ))
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
