//! Task record persistence
//!
//! A flat keyed collection of [`TaskRecord`]s that lives outside every
//! workspace. [`JsonTaskStore`] keeps the whole collection in one JSON file
//! and replaces it atomically on every write (backup, temp file, rename), so a
//! crash mid-write leaves either the old or the new queue on disk, never a
//! torn one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{info, warn};

use crate::task::TaskRecord;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// Queue file exists but does not parse
    #[error("Corrupt queue file {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    /// Another thread panicked while holding the store lock
    #[error("Store lock poisoned")]
    LockPoisoned,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn corrupt(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.as_ref().to_path_buf(),
            message: message.into(),
        }
    }
}

/// Keyed task record collection with atomic replace semantics
pub trait TaskStore: Send + Sync {
    fn load_all(&self) -> StoreResult<Vec<TaskRecord>>;
    fn get(&self, id: &str) -> StoreResult<Option<TaskRecord>>;
    fn upsert(&self, record: &TaskRecord) -> StoreResult<()>;
    /// Returns whether a record was removed
    fn remove(&self, id: &str) -> StoreResult<bool>;
}

/// Shared reference to a TaskStore
pub type SharedTaskStore = Arc<dyn TaskStore>;

// ============================================================================
// JSON file store
// ============================================================================

/// All task records in one pretty-printed JSON object keyed by task ID.
#[derive(Debug)]
pub struct JsonTaskStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl JsonTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        self.path.with_extension("json.backup")
    }

    fn guard(&self) -> StoreResult<MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn read_file(path: &Path) -> StoreResult<Option<BTreeMap<String, TaskRecord>>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Some(BTreeMap::new()));
        }
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::corrupt(path, e.to_string()))
    }

    /// Load the map, falling back to the backup if the primary is corrupt.
    fn read_map(&self) -> StoreResult<BTreeMap<String, TaskRecord>> {
        match Self::read_file(&self.path) {
            Ok(Some(map)) => return Ok(map),
            Ok(None) => {}
            Err(StoreError::Corrupt { message, .. }) => {
                warn!(
                    path = %self.path.display(),
                    error = %message,
                    "Queue file is corrupt, trying backup"
                );
                let backup = self.backup_path();
                return match Self::read_file(&backup)? {
                    Some(map) => {
                        info!(path = %backup.display(), tasks = map.len(), "Recovered queue from backup");
                        Ok(map)
                    }
                    None => Err(StoreError::corrupt(&self.path, message)),
                };
            }
            Err(e) => return Err(e),
        }
        Ok(BTreeMap::new())
    }

    fn write_map(&self, map: &BTreeMap<String, TaskRecord>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if self.path.exists() {
            if let Err(e) = std::fs::copy(&self.path, self.backup_path()) {
                warn!(path = %self.path.display(), error = %e, "Failed to back up queue file");
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(map)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl TaskStore for JsonTaskStore {
    fn load_all(&self) -> StoreResult<Vec<TaskRecord>> {
        let _guard = self.guard()?;
        Ok(self.read_map()?.into_values().collect())
    }

    fn get(&self, id: &str) -> StoreResult<Option<TaskRecord>> {
        let _guard = self.guard()?;
        Ok(self.read_map()?.remove(id))
    }

    fn upsert(&self, record: &TaskRecord) -> StoreResult<()> {
        let _guard = self.guard()?;
        let mut map = self.read_map()?;
        map.insert(record.id.clone(), record.clone());
        self.write_map(&map)
    }

    fn remove(&self, id: &str) -> StoreResult<bool> {
        let _guard = self.guard()?;
        let mut map = self.read_map()?;
        let removed = map.remove(id).is_some();
        if removed {
            self.write_map(&map)?;
        }
        Ok(removed)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Non-durable store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    records: Mutex<BTreeMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> StoreResult<MutexGuard<'_, BTreeMap<String, TaskRecord>>> {
        self.records.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl TaskStore for MemoryTaskStore {
    fn load_all(&self) -> StoreResult<Vec<TaskRecord>> {
        Ok(self.records()?.values().cloned().collect())
    }

    fn get(&self, id: &str) -> StoreResult<Option<TaskRecord>> {
        Ok(self.records()?.get(id).cloned())
    }

    fn upsert(&self, record: &TaskRecord) -> StoreResult<()> {
        self.records()?.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> StoreResult<bool> {
        Ok(self.records()?.remove(id).is_some())
    }
}
