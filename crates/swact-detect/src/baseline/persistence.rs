//! Baseline persistence: store and reload the flat baseline record so a
//! detection run does not have to repeat Monte Carlo sampling.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{EngineError, EngineResult};

use super::model::{BaselineModel, BaselineRecord};

/// Storage for persisted baseline records.
pub trait BaselineStore {
    /// Replace the stored record.
    fn save(&self, record: &BaselineRecord) -> EngineResult<()>;

    /// Load the stored record, `None` if nothing has been saved.
    fn load(&self) -> EngineResult<Option<BaselineRecord>>;

    /// Persist a model's flat record.
    fn save_model(&self, model: &BaselineModel) -> EngineResult<()> {
        self.save(&model.to_record())
    }

    /// Load and validate a model, applying the given variance floor.
    fn load_model(&self, variance_floor: f64) -> EngineResult<Option<BaselineModel>> {
        self.load()?
            .map(|record| BaselineModel::from_record(record, variance_floor))
            .transpose()
    }
}

/// JSON-file store. Writes go to a `.tmp` sibling first and are renamed
/// into place.
#[derive(Clone, Debug)]
pub struct JsonFileBaseline {
    path: PathBuf,
}

impl JsonFileBaseline {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BaselineStore for JsonFileBaseline {
    fn save(&self, record: &BaselineRecord) -> EngineResult<()> {
        let json = record.to_json_pretty()?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), signals = record.len(), "baseline saved");
        Ok(())
    }

    fn load(&self) -> EngineResult<Option<BaselineRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        let record = BaselineRecord::from_json(&contents)?;
        debug!(path = %self.path.display(), signals = record.len(), "baseline loaded");
        Ok(Some(record))
    }
}

/// In-memory store (for testing).
#[derive(Debug, Default)]
pub struct InMemoryBaseline {
    data: Mutex<Option<BaselineRecord>>,
}

impl InMemoryBaseline {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BaselineStore for InMemoryBaseline {
    fn save(&self, record: &BaselineRecord) -> EngineResult<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| EngineError::Persistence("baseline store lock poisoned".into()))?;
        *data = Some(record.clone());
        Ok(())
    }

    fn load(&self) -> EngineResult<Option<BaselineRecord>> {
        let data = self
            .data
            .lock()
            .map_err(|_| EngineError::Persistence("baseline store lock poisoned".into()))?;
        Ok(data.clone())
    }
}
