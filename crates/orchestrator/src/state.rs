//! Persisted orchestration state
//!
//! The state document records, for every applied unit, the payload its
//! driver persisted plus the marker table those payloads refer to:
//!
//! ```json
//! {
//!   "version": "0.1.0",
//!   "markers": { "<hash>": { "stack": "net", "unit": "vpc", "output": "vpc_id" } },
//!   "units": { "net.vpc": { "type": "tfmodule", ... } }
//! }
//! ```
//!
//! The document is stored through the project's state backend, which also
//! owns the lock guarding it.

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::marker::MarkerTable;
use crate::project::Project;
use crate::settings::VERSION;
use crate::unit::{Unit, UnitKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// File written by [`pull_state`] in the project directory
pub const PULLED_STATE_FILE: &str = "stackwork.state.pulled";

/// Prefix of backups written by [`backup_state`]
pub const BACKUP_PREFIX: &str = "stackwork.state.backup";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub markers: MarkerTable,
    #[serde(default)]
    pub units: BTreeMap<String, Value>,
}

impl StateDocument {
    pub fn parse(blob: &str) -> Result<Self> {
        let doc: Self = serde_json::from_str(blob).map_err(|e| Error::StateLoad(e.to_string()))?;
        for (key, record) in &doc.units {
            if UnitKey::parse(key).is_none() {
                return Err(Error::StateLoad(format!("invalid unit key '{key}'")));
            }
            if record.get("type").and_then(Value::as_str).is_none() {
                return Err(Error::StateLoad(format!("unit '{key}' has no type")));
            }
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Held state lock, released on drop
#[derive(Debug)]
pub struct StateLock {
    backend: Arc<dyn Backend>,
    released: bool,
}

impl StateLock {
    pub fn acquire(backend: Arc<dyn Backend>) -> Result<Self> {
        backend.lock_state()?;
        log::debug!("Locked state in backend '{}'", backend.name());
        Ok(Self {
            backend,
            released: false,
        })
    }

    /// Release the lock, reporting failure
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.backend.unlock_state()
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.backend.unlock_state() {
            log::warn!("Failed to unlock state in backend '{}': {e}", self.backend.name());
        } else {
            log::debug!("Unlocked state in backend '{}'", self.backend.name());
        }
    }
}

/// Take the project's state lock
pub fn lock_state(project: &Project) -> Result<StateLock> {
    StateLock::acquire(project.shared_state_backend()?)
}

/// Remove the project's state lock, whoever holds it
pub fn unlock_state(project: &Project) -> Result<()> {
    project.state_backend()?.unlock_state()
}

/// The persisted snapshot as seen by this run
#[derive(Debug)]
pub struct StateProject {
    backend: Arc<dyn Backend>,
    document: StateDocument,
    /// Units classified as changed in the current pass
    pub(crate) changed: BTreeSet<UnitKey>,
}

impl StateProject {
    /// Load the snapshot; a missing one is empty
    pub fn load(project: &Project) -> Result<Self> {
        let backend = project.shared_state_backend()?;
        let document = match backend.read_state()? {
            Some(blob) => StateDocument::parse(&blob)?,
            None => {
                log::debug!("No saved state in backend '{}'", backend.name());
                StateDocument::default()
            }
        };
        log::debug!("Loaded state with {} unit(s)", document.units.len());
        Ok(Self {
            backend,
            document,
            changed: BTreeSet::new(),
        })
    }

    pub fn document(&self) -> &StateDocument {
        &self.document
    }

    #[cfg(test)]
    pub(crate) fn document_mut(&mut self) -> &mut StateDocument {
        &mut self.document
    }

    pub fn contains(&self, key: &UnitKey) -> bool {
        self.document.units.contains_key(&key.to_string())
    }

    pub fn record(&self, key: &UnitKey) -> Option<&Value> {
        self.document.units.get(&key.to_string())
    }

    pub fn keys(&self) -> Vec<UnitKey> {
        self.document
            .units
            .keys()
            .filter_map(|k| UnitKey::parse(k))
            .collect()
    }

    pub fn markers(&self) -> &MarkerTable {
        &self.document.markers
    }

    /// Record a unit's current payload
    pub fn update_unit(&mut self, unit: &dyn Unit) -> Result<()> {
        self.document.units.insert(unit.key().to_string(), unit.get_state()?);
        Ok(())
    }

    pub fn remove_unit(&mut self, key: &UnitKey) {
        self.document.units.remove(&key.to_string());
    }

    /// Rebuild a persisted unit through the project's drivers
    pub fn restore_unit(&self, project: &Project, key: &UnitKey) -> Result<Box<dyn Unit>> {
        let record = self
            .record(key)
            .ok_or_else(|| Error::internal(format!("unit '{key}' not in state")))?;
        project.drivers().restore(record, &project.settings)
    }

    /// Write the snapshot through the state backend
    pub fn save(&mut self, project: &Project) -> Result<()> {
        self.document.markers.merge(project.markers());
        self.document.version = VERSION.to_string();
        self.backend.write_state(&self.document.to_json()?)?;
        log::debug!("Saved state with {} unit(s)", self.document.units.len());
        Ok(())
    }
}

fn read_blob(project: &Project) -> Result<String> {
    let backend = project.state_backend()?;
    backend
        .read_state()?
        .ok_or_else(|| Error::config(format!("no state saved in backend '{}'", backend.name())))
}

/// Copy the state blob into the project directory
pub fn pull_state(project: &Project) -> Result<PathBuf> {
    let blob = read_blob(project)?;
    let path = project.settings.working_dir.join(PULLED_STATE_FILE);
    fs::write(&path, blob).map_err(|e| Error::path(&path, e))?;
    Ok(path)
}

/// Write a timestamped copy of the state blob into the project directory
pub fn backup_state(project: &Project) -> Result<PathBuf> {
    let blob = read_blob(project)?;
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let path = project
        .settings
        .working_dir
        .join(format!("{BACKUP_PREFIX}.{stamp}"));
    fs::write(&path, blob).map_err(|e| Error::path(&path, e))?;
    Ok(path)
}
