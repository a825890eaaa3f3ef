//! Task records and the coarse status lifecycle
//!
//! A [`TaskRecord`] is the control-plane view of one unit of queued work. Its
//! [`TaskStatus`] is owned by the orchestrator and only ever changes through
//! [`TaskRecord::transition`], which checks the edge against a table keyed by
//! the [`TransitionCause`]. The workspace-local [`crate::phase::Phase`] is a
//! separate type; the two are joined only during reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::workspace::WorkspaceHandle;

/// Coarse scheduling state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// No prompt yet, cannot be scheduled
    NeedsPrompt,
    /// Eligible for admission
    Ready,
    /// Admitted, workspace materialized or materializing
    Running,
    /// Agent stopped and needs a human
    Waiting,
    /// Work complete
    Done,
    /// Stopped by the operator
    Paused,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::NeedsPrompt,
        Self::Ready,
        Self::Running,
        Self::Waiting,
        Self::Done,
        Self::Paused,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeedsPrompt => "needs-prompt",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Done => "done",
            Self::Paused => "paused",
        }
    }

    /// Position in the queue view (done first, paused last)
    pub fn sort_order(self) -> u8 {
        match self {
            Self::Done => 0,
            Self::Running => 1,
            Self::Waiting => 2,
            Self::Ready => 3,
            Self::NeedsPrompt => 4,
            Self::Paused => 5,
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Self::NeedsPrompt => "?",
            Self::Ready => "○",
            Self::Running => "●",
            Self::Waiting => "◐",
            Self::Done => "✓",
            Self::Paused => "⏸",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::NeedsPrompt => "Needs Prompt",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Waiting => "Waiting",
            Self::Done => "Done",
            Self::Paused => "Paused",
        }
    }

    /// Holds a capacity slot
    pub fn is_active(self) -> bool {
        self == Self::Running
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| OrchestratorError::validation(format!("unknown task status: {s}")))
    }
}

/// What caused a status change. The same edge can be legal for one cause
/// and illegal for another (a Running task only returns to Ready when its
/// materialization failed or an operator resets it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    PromptSet,
    PromptCleared,
    Admitted,
    Adopted,
    MaterializeFailed,
    PhaseSettled,
    WorkspaceLost,
    OperatorPause,
    OperatorResume,
    OperatorReset,
}

impl fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PromptSet => "prompt set",
            Self::PromptCleared => "prompt cleared",
            Self::Admitted => "admitted",
            Self::Adopted => "adopted",
            Self::MaterializeFailed => "materialize failed",
            Self::PhaseSettled => "phase settled",
            Self::WorkspaceLost => "workspace lost",
            Self::OperatorPause => "operator pause",
            Self::OperatorResume => "operator resume",
            Self::OperatorReset => "operator reset",
        };
        f.write_str(s)
    }
}

/// Legal status edges, per cause.
///
/// ```text
/// PromptSet          NeedsPrompt → Ready
/// PromptCleared      Ready → NeedsPrompt
/// Admitted, Adopted  Ready → Running
/// MaterializeFailed  Running → Ready
/// PhaseSettled       Running → Done | Waiting
/// WorkspaceLost      Running → Waiting
/// OperatorPause      NeedsPrompt | Ready | Running | Waiting → Paused
/// OperatorResume     Paused → Ready | NeedsPrompt
/// OperatorReset      Running | Waiting | Done | Paused → Ready | NeedsPrompt
/// ```
pub fn is_legal(from: TaskStatus, to: TaskStatus, cause: TransitionCause) -> bool {
    use TaskStatus::*;
    use TransitionCause::*;

    match cause {
        PromptSet => matches!((from, to), (NeedsPrompt, Ready)),
        PromptCleared => matches!((from, to), (Ready, NeedsPrompt)),
        Admitted | Adopted => matches!((from, to), (Ready, Running)),
        MaterializeFailed => matches!((from, to), (Running, Ready)),
        PhaseSettled => matches!((from, to), (Running, Done) | (Running, Waiting)),
        WorkspaceLost => matches!((from, to), (Running, Waiting)),
        OperatorPause => {
            to == Paused && matches!(from, NeedsPrompt | Ready | Running | Waiting)
        }
        OperatorResume => from == Paused && matches!(to, Ready | NeedsPrompt),
        OperatorReset => {
            matches!(from, Running | Waiting | Done | Paused) && matches!(to, Ready | NeedsPrompt)
        }
    }
}

/// Input for creating a task (CLI, seed file, command inbox)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_priority() -> i64 {
    10
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            prompt: prompt.into(),
            priority,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Task IDs double as workspace directory names.
    pub fn validate(&self) -> OrchestratorResult<()> {
        validate_task_id(&self.id)
    }
}

/// Reject IDs that cannot be used as a single path component.
pub fn validate_task_id(id: &str) -> OrchestratorResult<()> {
    if id.trim().is_empty() {
        return Err(OrchestratorError::validation("task id must not be empty"));
    }
    if id != id.trim() {
        return Err(OrchestratorError::validation(format!(
            "task id {id:?} has surrounding whitespace"
        )));
    }
    if id == "." || id == ".." || id.contains('/') || id.contains('\\') || id.contains('\0') {
        return Err(OrchestratorError::validation(format!(
            "task id {id:?} is not a valid directory name"
        )));
    }
    Ok(())
}

/// One unit of queued work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    pub priority: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Provisioner handle, recorded after a successful materialization
    #[serde(default)]
    pub workspace: Option<WorkspaceHandle>,
    /// Insertion counter, breaks ties between equal creation timestamps
    #[serde(default)]
    pub seq: u64,
}

impl TaskRecord {
    /// New record from a spec; status follows the prompt.
    pub fn new(spec: TaskSpec, seq: u64) -> Self {
        let name = if spec.name.is_empty() {
            spec.id.clone()
        } else {
            spec.name
        };
        // A blank prompt is stored empty so NeedsPrompt always means ""
        let prompt = if spec.prompt.trim().is_empty() {
            String::new()
        } else {
            spec.prompt
        };
        Self {
            status: status_for_prompt(&prompt),
            id: spec.id,
            name,
            prompt,
            priority: spec.priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            workspace: None,
            seq,
        }
    }

    /// Scheduling order: priority, then creation time, then insertion order
    pub fn sort_key(&self) -> (i64, DateTime<Utc>, u64) {
        (self.priority, self.created_at, self.seq)
    }

    pub fn has_prompt(&self) -> bool {
        !self.prompt.trim().is_empty()
    }

    /// Status a task returns to when it becomes schedulable again
    pub fn eligible_status(&self) -> TaskStatus {
        status_for_prompt(&self.prompt)
    }

    /// Apply a status change if the lifecycle allows it.
    pub fn transition(&mut self, to: TaskStatus, cause: TransitionCause) -> OrchestratorResult<()> {
        if !is_legal(self.status, to, cause) {
            return Err(OrchestratorError::invalid_transition(
                &self.id,
                self.status,
                to,
            ));
        }
        // Ready and Running both require a prompt; NeedsPrompt requires none
        let prompt_ok = match to {
            TaskStatus::NeedsPrompt => !self.has_prompt(),
            TaskStatus::Ready | TaskStatus::Running => self.has_prompt(),
            _ => true,
        };
        if !prompt_ok {
            return Err(OrchestratorError::invalid_transition(
                &self.id,
                self.status,
                to,
            ));
        }

        let now = Utc::now();
        match to {
            TaskStatus::Running => {
                self.started_at = Some(now);
                self.completed_at = None;
            }
            TaskStatus::Done => self.completed_at = Some(now),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Replace the prompt, moving between NeedsPrompt and Ready as needed.
    ///
    /// Prompts of Running, Waiting, Done or Paused tasks can be edited but
    /// cannot be cleared.
    pub fn set_prompt(&mut self, prompt: impl Into<String>) -> OrchestratorResult<()> {
        let prompt = prompt.into();
        let empty = prompt.trim().is_empty();

        match (self.status, empty) {
            (TaskStatus::NeedsPrompt, false) => {
                self.prompt = prompt;
                self.transition(TaskStatus::Ready, TransitionCause::PromptSet)
            }
            (TaskStatus::Ready, true) => {
                self.prompt = String::new();
                self.transition(TaskStatus::NeedsPrompt, TransitionCause::PromptCleared)
            }
            (TaskStatus::NeedsPrompt, true) => {
                self.prompt = String::new();
                Ok(())
            }
            (_, true) => Err(OrchestratorError::validation(format!(
                "cannot clear the prompt of {} task {}",
                self.status, self.id
            ))),
            (_, false) => {
                self.prompt = prompt;
                Ok(())
            }
        }
    }
}

fn status_for_prompt(prompt: &str) -> TaskStatus {
    if prompt.trim().is_empty() {
        TaskStatus::NeedsPrompt
    } else {
        TaskStatus::Ready
    }
}
