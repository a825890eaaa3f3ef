//! Workspace-local phase marker
//!
//! The phase marker is a one-line text file inside the workspace written by
//! the agent loop (or by the orchestrator at admission). It is the
//! authoritative answer to "what is the agent doing right now" and outlives
//! the orchestrator process. The engine only reads it, except for the initial
//! write at admission and the reset to `None` before a retry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::layout::WorkspaceLayout;

/// Lifecycle phase of one workspace incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// No task materialized yet (or reset)
    #[default]
    None,
    /// Agent is building a plan and todo list
    Planning,
    /// Planning done, waiting to execute
    Ready,
    /// Agent loop is running
    Executing,
    /// Work complete
    Done,
    /// Agent could not authenticate
    AuthError,
    /// Agent loop failed
    Error,
    /// Agent loop hit its iteration budget
    #[serde(rename = "max-iterations-reached")]
    MaxIterations,
    /// Agent is blocked on questions for a human
    AwaitingAnswers,
    /// Work complete, needs human review
    ReadyForReview,
}

impl Phase {
    /// Text written to the marker file
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Planning => "planning",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Done => "done",
            Self::AuthError => "auth-error",
            Self::Error => "error",
            Self::MaxIterations => "max-iterations-reached",
            Self::AwaitingAnswers => "awaiting-answers",
            Self::ReadyForReview => "ready-for-review",
        }
    }

    /// Human-readable label
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "no task",
            Self::Planning => "planning",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Done => "done",
            Self::AuthError => "auth error",
            Self::Error => "error",
            Self::MaxIterations => "max iterations",
            Self::AwaitingAnswers => "needs input",
            Self::ReadyForReview => "review",
        }
    }

    /// Terminal for this workspace incarnation
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::AuthError | Self::Error)
    }

    /// Agent has stopped making progress on its own: terminal, suspended,
    /// or handed over for review.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Done
                | Self::AuthError
                | Self::Error
                | Self::MaxIterations
                | Self::AwaitingAnswers
                | Self::ReadyForReview
        )
    }

    /// Agent is still working through planning or execution
    pub fn is_active(self) -> bool {
        matches!(self, Self::Planning | Self::Ready | Self::Executing)
    }

    /// Error text recorded on the task when this phase parks it
    pub fn failure_message(self) -> Option<&'static str> {
        match self {
            Self::AuthError => Some("agent authentication failed"),
            Self::Error => Some("agent reported an error"),
            Self::MaxIterations => Some("agent reached its iteration limit"),
            Self::AwaitingAnswers => Some("agent is awaiting answers"),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Phase {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Ok(Self::None),
            "planning" => Ok(Self::Planning),
            "ready" => Ok(Self::Ready),
            "executing" => Ok(Self::Executing),
            "done" => Ok(Self::Done),
            "auth-error" => Ok(Self::AuthError),
            "error" => Ok(Self::Error),
            "max-iterations-reached" => Ok(Self::MaxIterations),
            "awaiting-answers" => Ok(Self::AwaitingAnswers),
            "ready-for-review" => Ok(Self::ReadyForReview),
            other => Err(OrchestratorError::InvalidPhase {
                value: other.to_string(),
            }),
        }
    }
}

/// Shared reference to a PhaseMarker
pub type SharedPhaseMarker = Arc<PhaseMarker>;

/// Reads and writes phase marker files for every workspace.
///
/// Remembers the last phase it successfully parsed per workspace so a
/// half-written or garbled marker reads as "unchanged" instead of failing.
#[derive(Debug)]
pub struct PhaseMarker {
    layout: WorkspaceLayout,
    last_known: Mutex<HashMap<String, Phase>>,
}

impl PhaseMarker {
    pub fn new(layout: WorkspaceLayout) -> Self {
        Self {
            layout,
            last_known: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared(self) -> SharedPhaseMarker {
        Arc::new(self)
    }

    pub fn path(&self, workspace_id: &str) -> PathBuf {
        self.layout.phase_path(workspace_id)
    }

    fn remember(&self, workspace_id: &str, phase: Phase) {
        self.last_known
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(workspace_id.to_string(), phase);
    }

    fn previous(&self, workspace_id: &str) -> Phase {
        self.last_known
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(workspace_id)
            .copied()
            .unwrap_or_default()
    }

    /// Current phase; `None` when no marker exists.
    pub fn read(&self, workspace_id: &str) -> Phase {
        let path = self.path(workspace_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.remember(workspace_id, Phase::None);
                return Phase::None;
            }
            Err(e) => {
                warn!(
                    workspace = workspace_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to read phase marker, keeping previous phase"
                );
                return self.previous(workspace_id);
            }
        };

        match content.parse::<Phase>() {
            Ok(phase) => {
                self.remember(workspace_id, phase);
                phase
            }
            Err(e) => {
                let previous = self.previous(workspace_id);
                debug!(
                    workspace = workspace_id,
                    error = %e,
                    previous = %previous,
                    "Unparseable phase marker, keeping previous phase"
                );
                previous
            }
        }
    }

    /// Atomically overwrite the marker.
    pub fn write(&self, workspace_id: &str, phase: Phase) -> OrchestratorResult<()> {
        let path = self.path(workspace_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write(&path, phase.as_str())?;
        self.remember(workspace_id, phase);
        Ok(())
    }

    /// Reset the marker to `None` before a fresh execution attempt.
    pub fn clear(&self, workspace_id: &str) -> OrchestratorResult<()> {
        let path = self.path(workspace_id);
        if path.exists() {
            atomic_write(&path, Phase::None.as_str())?;
        }
        self.remember(workspace_id, Phase::None);
        Ok(())
    }

    /// Checklist progress from the agent's todo file as (completed, total).
    pub fn todo_progress(&self, workspace_id: &str) -> (usize, usize) {
        match std::fs::read_to_string(self.layout.todos_path(workspace_id)) {
            Ok(content) => count_todos(&content),
            Err(_) => (0, 0),
        }
    }
}

/// Count markdown checkboxes as (completed, total)
pub fn count_todos(content: &str) -> (usize, usize) {
    let open = content.matches("- [ ]").count();
    let done = content.matches("- [x]").count() + content.matches("- [X]").count();
    (done, open + done)
}

/// Write to a sibling temp file, then rename over the target.
pub(crate) fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let mut temp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)
}
