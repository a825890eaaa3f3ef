//! Status snapshot for read-only views
//!
//! The daemon writes `status.json` after every tick so the CLI can show the
//! merged view (record status, phase, milestone, startup phase, todos)
//! without talking to the running process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::OrchestratorResult;
use crate::milestone::Milestone;
use crate::phase::{atomic_write, Phase};
use crate::progress::StartupPhase;
use crate::task::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    pub name: String,
    pub priority: i64,
    pub status: TaskStatus,
    pub phase: Phase,
    #[serde(default)]
    pub milestone: Option<Milestone>,
    #[serde(default)]
    pub startup: Option<StartupPhase>,
    /// (completed, total) checklist items
    #[serde(default)]
    pub todos: Option<(usize, usize)>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskView {
    /// One-line progress text: todos while the agent works, otherwise the
    /// furthest startup milestone.
    pub fn progress_text(&self) -> String {
        if let Some((done, total)) = self.todos.filter(|(_, total)| *total > 0) {
            return format!("{}/{} todos", done, total);
        }
        match (self.milestone, self.startup) {
            (Some(m), _) => m.label().to_string(),
            (None, Some(s)) if s != StartupPhase::NotStarted => {
                format!("{} {}", s.progress(), s.description())
            }
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub capacity: usize,
    pub running: usize,
    pub tasks: Vec<TaskView>,
}

impl StatusSnapshot {
    pub fn save(&self, path: &Path) -> OrchestratorResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write(path, &serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// `None` if no snapshot has been written yet
    pub fn load(path: &Path) -> OrchestratorResult<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskView> {
        self.tasks.iter().find(|t| t.id == id)
    }
}
