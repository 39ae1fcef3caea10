//! # swact-replay
//!
//! A [`SimulationBackend`] that replays recorded switching-activity traces.
//!
//! `SimulationConfig::trace_path` points either at a JSON file holding one
//! trace record or a list of them, or at a directory of `*.json` files with
//! one record each. Every `run` call serves the next record, cycling through
//! them in order. A path is read once and kept in memory.
//!
//! ```text
//!   {"cycles": 100, "signals": {"clk": 200, "u_alu.result": 1043}}
//! ```
//!
//! `cycles` defaults to half the clock's toggle count (rising edges) and
//! `total_toggles` to the sum over every signal, the clock included. The
//! clock itself is not reported as a per-signal metric.

#![deny(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use swact_detect::{
    sum_toggles, ActivitySample, SignalName, SimulationBackend, SimulationConfig, SimulationError,
};

/// One recorded simulation run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycles: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_toggles: Option<u64>,
    /// Toggle count per signal, clock included.
    pub signals: BTreeMap<String, u64>,
}

impl TraceRecord {
    pub fn new<'a, I>(signals: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        Self {
            cycles: None,
            total_toggles: None,
            signals: signals
                .into_iter()
                .map(|(name, count)| (name.to_string(), count))
                .collect(),
        }
    }

    pub fn with_cycles(mut self, cycles: u64) -> Self {
        self.cycles = Some(cycles);
        self
    }

    /// Convert to an activity sample, enforcing the backend contract.
    pub fn to_sample(&self, clock: &str, source: &Path) -> Result<ActivitySample, SimulationError> {
        let clock_toggles =
            self.signals
                .get(clock)
                .copied()
                .ok_or_else(|| SimulationError::MissingClock {
                    clock: clock.to_string(),
                })?;

        let cycles = self.cycles.unwrap_or(clock_toggles / 2);
        if cycles == 0 {
            return Err(SimulationError::ZeroCycles {
                context: format!("trace {}", source.display()),
            });
        }

        let total_toggles = self
            .total_toggles
            .unwrap_or_else(|| sum_toggles(self.signals.values()));
        let per_signal_toggles = self
            .signals
            .iter()
            .filter(|(name, _)| name.as_str() != clock)
            .map(|(name, &count)| (SignalName::from(name.as_str()), count))
            .collect();

        Ok(ActivitySample {
            total_toggles,
            cycles,
            per_signal_toggles,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TraceFile {
    Many(Vec<TraceRecord>),
    One(TraceRecord),
}

/// A record and the file it was read from.
#[derive(Clone, Debug)]
struct LoadedTrace {
    record: TraceRecord,
    source: PathBuf,
}

/// Replays recorded traces, one record per call.
///
/// Each trace path is read once, on first use, and served from memory
/// afterwards. A failed load is not cached.
#[derive(Debug, Default)]
pub struct TraceReplayBackend {
    cursor: AtomicUsize,
    loaded: Mutex<HashMap<PathBuf, Arc<Vec<LoadedTrace>>>>,
}

impl TraceReplayBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `run` calls served so far.
    pub fn runs(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Records behind `path`, loading them on first use.
    async fn traces(&self, path: &Path) -> Result<Arc<Vec<LoadedTrace>>, SimulationError> {
        let mut loaded = self.loaded.lock().await;
        if let Some(traces) = loaded.get(path) {
            return Ok(Arc::clone(traces));
        }
        let traces = Arc::new(load_traces(path).await?);
        debug!(trace = %path.display(), records = traces.len(), "traces loaded");
        loaded.insert(path.to_path_buf(), Arc::clone(&traces));
        Ok(traces)
    }
}

#[async_trait]
impl SimulationBackend for TraceReplayBackend {
    fn name(&self) -> &str {
        "trace-replay"
    }

    async fn run(&self, config: &SimulationConfig) -> Result<ActivitySample, SimulationError> {
        let path = config.trace_path.as_deref().ok_or_else(|| {
            SimulationError::Backend(format!(
                "no trace path configured for variant `{}`",
                config.variant
            ))
        })?;
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let traces = self.traces(path).await?;
        let trace = &traces[index % traces.len()];
        let sample = trace.record.to_sample(&config.clock, &trace.source)?;

        debug!(
            variant = %config.variant,
            trace = %trace.source.display(),
            index,
            cycles = sample.cycles,
            signals = sample.per_signal_toggles.len(),
            "trace replayed"
        );
        Ok(sample)
    }
}

/// Every record under `path`: one file of records, or a directory of
/// one-record files in name order. Never empty.
async fn load_traces(path: &Path) -> Result<Vec<LoadedTrace>, SimulationError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| unavailable(path, e))?;

    if !metadata.is_dir() {
        let records = read_records(path).await?;
        return Ok(records
            .into_iter()
            .map(|record| LoadedTrace {
                record,
                source: path.to_path_buf(),
            })
            .collect());
    }

    let mut traces = Vec::new();
    for file in list_traces(path).await? {
        let mut records = read_records(&file).await?;
        if records.len() != 1 {
            return Err(SimulationError::MalformedTrace {
                path: file,
                reason: format!("expected one record per file, found {}", records.len()),
            });
        }
        traces.push(LoadedTrace {
            record: records.remove(0),
            source: file,
        });
    }
    Ok(traces)
}

fn unavailable(path: &Path, e: std::io::Error) -> SimulationError {
    SimulationError::TraceUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

async fn read_records(path: &Path) -> Result<Vec<TraceRecord>, SimulationError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| unavailable(path, e))?;
    let parsed: TraceFile =
        serde_json::from_str(&contents).map_err(|e| SimulationError::MalformedTrace {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let records = match parsed {
        TraceFile::Many(records) => records,
        TraceFile::One(record) => vec![record],
    };
    if records.is_empty() {
        return Err(SimulationError::MalformedTrace {
            path: path.to_path_buf(),
            reason: "trace contains no records".into(),
        });
    }
    Ok(records)
}

/// `*.json` files of a trace directory, sorted by name.
async fn list_traces(dir: &Path) -> Result<Vec<PathBuf>, SimulationError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| unavailable(dir, e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| unavailable(dir, e))? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(SimulationError::TraceUnavailable {
            path: dir.to_path_buf(),
            reason: "directory contains no .json traces".into(),
        });
    }
    files.sort();
    Ok(files)
}
