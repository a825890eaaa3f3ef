//! Durable cross-process command inbox
//!
//! Commands from other processes (the CLI) are dropped into a directory as
//! one JSON file each and drained by the control loop at the start of every
//! tick. Files are written under a temporary name and renamed into place, so
//! the loop never sees a half-written command.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::commands::TaskCommand;
use crate::error::OrchestratorResult;

#[derive(Debug, Clone)]
pub struct CommandInbox {
    dir: PathBuf,
}

impl CommandInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queue a command for the next tick. Returns the file it was written to.
    pub fn submit(&self, command: &TaskCommand) -> OrchestratorResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        // Timestamp prefix keeps lexical order equal to submission order
        let name = format!(
            "{}-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            uuid::Uuid::new_v4().simple()
        );
        let path = self.dir.join(&name);
        let temp = self.dir.join(format!(".{name}.tmp"));
        std::fs::write(&temp, serde_json::to_vec_pretty(command)?)?;
        std::fs::rename(&temp, &path)?;
        Ok(path)
    }

    /// Remove and return every pending command in submission order.
    ///
    /// Unparseable files are moved aside with a `.rejected` suffix.
    pub fn drain(&self) -> Vec<TaskCommand> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to read command inbox");
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter(|p| {
                !p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'))
            })
            .collect();
        paths.sort();

        let mut commands = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<TaskCommand>(&bytes).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(command) => {
                    if let Err(e) = std::fs::remove_file(&path) {
                        // Leaving it would replay the command next tick
                        warn!(path = %path.display(), error = %e, "Failed to remove command file, skipping");
                        continue;
                    }
                    commands.push(command);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Rejecting malformed command file");
                    let _ = std::fs::rename(&path, path.with_extension("json.rejected"));
                }
            }
        }
        commands
    }
}
