//! Initial task lists
//!
//! A seed file is a TOML document with one `[[tasks]]` table per task.
//! Seeding is idempotent: tasks whose ID is already queued are skipped, so
//! the same file can be applied on every start.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::queue::TaskQueue;
use crate::task::TaskSpec;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl SeedFile {
    pub fn load(path: &Path) -> OrchestratorResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| OrchestratorError::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let seed: Self = toml::from_str(&content).map_err(|e| OrchestratorError::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        for spec in &seed.tasks {
            spec.validate()?;
        }
        Ok(seed)
    }
}

/// Enqueue every seed task; returns how many were new.
pub fn seed_queue(queue: &mut TaskQueue, specs: impl IntoIterator<Item = TaskSpec>) -> OrchestratorResult<usize> {
    let mut added = 0;
    for spec in specs {
        if queue.enqueue(spec)? {
            added += 1;
        }
    }
    info!(added, total = queue.len(), "Seeded task queue");
    Ok(added)
}
