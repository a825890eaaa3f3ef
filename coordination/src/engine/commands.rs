//! Operator commands
//!
//! Every mutation that does not come from the control loop itself arrives as
//! a [`TaskCommand`], either over the in-process channel behind an
//! [`EngineHandle`] or through the durable inbox. Both paths end in
//! [`Engine::apply`], which runs on the loop, so commands never race with
//! admission or reconciliation.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::snapshot::StatusSnapshot;
use super::Engine;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::health::HealthIssue;
use crate::task::{TaskSpec, TaskStatus, TransitionCause};

/// A serializable operator command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TaskCommand {
    Enqueue { spec: TaskSpec },
    SetPrompt { id: String, prompt: String },
    /// Tear the workspace down and park the task
    Pause { id: String },
    /// Make a paused task eligible again
    Resume { id: String },
    /// Retry: return a Running, Waiting, Done or Paused task to the queue
    Reset { id: String },
    ClearError { id: String },
    Remove { id: String },
    /// Reconcile Running tasks now instead of on the next tick
    Reconcile,
}

impl TaskCommand {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Enqueue { spec } => Some(&spec.id),
            Self::SetPrompt { id, .. }
            | Self::Pause { id }
            | Self::Resume { id }
            | Self::Reset { id }
            | Self::ClearError { id }
            | Self::Remove { id } => Some(id),
            Self::Reconcile => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Enqueue { .. } => "enqueue",
            Self::SetPrompt { .. } => "set_prompt",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::Reset { .. } => "reset",
            Self::ClearError { .. } => "clear_error",
            Self::Remove { .. } => "remove",
            Self::Reconcile => "reconcile",
        }
    }
}

/// Messages accepted by a running engine
#[derive(Debug)]
pub enum EngineCommand {
    Apply {
        command: TaskCommand,
        reply: oneshot::Sender<OrchestratorResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Health {
        reply: oneshot::Sender<Vec<HealthIssue>>,
    },
    Shutdown,
}

/// Cloneable sender side of the engine's command channel
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::Sender<EngineCommand>) -> Self {
        Self { tx }
    }

    async fn send(&self, command: EngineCommand) -> OrchestratorResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| OrchestratorError::EngineStopped)
    }

    /// Apply a command on the loop and wait for its result.
    pub async fn apply(&self, command: TaskCommand) -> OrchestratorResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Apply { command, reply }).await?;
        rx.await.map_err(|_| OrchestratorError::EngineStopped)?
    }

    pub async fn enqueue(&self, spec: TaskSpec) -> OrchestratorResult<()> {
        self.apply(TaskCommand::Enqueue { spec }).await
    }

    pub async fn set_prompt(&self, id: impl Into<String>, prompt: impl Into<String>) -> OrchestratorResult<()> {
        self.apply(TaskCommand::SetPrompt {
            id: id.into(),
            prompt: prompt.into(),
        })
        .await
    }

    pub async fn pause(&self, id: impl Into<String>) -> OrchestratorResult<()> {
        self.apply(TaskCommand::Pause { id: id.into() }).await
    }

    pub async fn resume(&self, id: impl Into<String>) -> OrchestratorResult<()> {
        self.apply(TaskCommand::Resume { id: id.into() }).await
    }

    pub async fn reset(&self, id: impl Into<String>) -> OrchestratorResult<()> {
        self.apply(TaskCommand::Reset { id: id.into() }).await
    }

    pub async fn reconcile(&self) -> OrchestratorResult<()> {
        self.apply(TaskCommand::Reconcile).await
    }

    pub async fn snapshot(&self) -> OrchestratorResult<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| OrchestratorError::EngineStopped)
    }

    pub async fn health(&self) -> OrchestratorResult<Vec<HealthIssue>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Health { reply }).await?;
        rx.await.map_err(|_| OrchestratorError::EngineStopped)
    }

    pub async fn shutdown(&self) -> OrchestratorResult<()> {
        self.send(EngineCommand::Shutdown).await
    }
}

// ============================================================================
// Command application
// ============================================================================

impl Engine {
    /// Apply one operator command.
    pub async fn apply(&mut self, command: TaskCommand) -> OrchestratorResult<()> {
        info!(
            command = command.name(),
            task_id = command.task_id().unwrap_or("-"),
            "Applying command"
        );
        match command {
            TaskCommand::Enqueue { spec } => {
                self.queue.enqueue(spec)?;
                Ok(())
            }
            TaskCommand::SetPrompt { id, prompt } => self.queue.set_prompt(&id, prompt),
            TaskCommand::Pause { id } => self.pause(&id),
            TaskCommand::Resume { id } => self.resume(&id),
            TaskCommand::Reset { id } => self.reset(&id),
            TaskCommand::ClearError { id } => self.queue.update(&id, |task| {
                task.last_error = None;
                Ok(())
            }),
            TaskCommand::Remove { id } => self.remove(&id),
            TaskCommand::Reconcile => self.reconcile().await,
        }
    }

    /// Drain the durable inbox, logging failures; a bad command never
    /// blocks the ones behind it.
    pub(crate) async fn drain_inbox(&mut self) -> usize {
        let Some(inbox) = self.inbox.clone() else {
            return 0;
        };
        let commands = inbox.drain();
        let count = commands.len();
        for command in commands {
            let name = command.name();
            if let Err(e) = self.apply(command).await {
                warn!(command = name, error = %e, "Inbox command failed");
            }
        }
        count
    }

    fn pause(&mut self, id: &str) -> OrchestratorResult<()> {
        let status = self
            .queue
            .get(id)
            .ok_or_else(|| OrchestratorError::task_not_found(id))?
            .status;
        if status == TaskStatus::Paused {
            return Ok(());
        }

        let handle = self.queue.update(id, |task| {
            task.transition(TaskStatus::Paused, TransitionCause::OperatorPause)?;
            Ok(task.workspace.take())
        })?;
        self.watchers.stop(id);
        if let Some(handle) = handle {
            self.spawn_teardown(handle);
        }
        info!(task_id = %id, "Task paused");
        Ok(())
    }

    fn resume(&mut self, id: &str) -> OrchestratorResult<()> {
        self.queue.update(id, |task| {
            let target = task.eligible_status();
            task.transition(target, TransitionCause::OperatorResume)
        })?;
        self.fresh_attempt(id);
        info!(task_id = %id, "Task resumed");
        Ok(())
    }

    fn reset(&mut self, id: &str) -> OrchestratorResult<()> {
        let handle = self.queue.update(id, |task| {
            let target = task.eligible_status();
            task.transition(target, TransitionCause::OperatorReset)?;
            task.completed_at = None;
            Ok(task.workspace.take())
        })?;
        self.watchers.stop(id);
        if let Some(handle) = handle {
            self.spawn_teardown(handle);
        }
        self.fresh_attempt(id);
        info!(task_id = %id, "Task reset for retry");
        Ok(())
    }

    fn remove(&mut self, id: &str) -> OrchestratorResult<()> {
        let removed = self.queue.remove(id)?;
        self.watchers.stop(id);
        self.tracker.reset_cursor(id);
        if let Some(handle) = removed.workspace {
            self.spawn_teardown(handle);
        }
        Ok(())
    }

    /// Forget progress from earlier attempts before a task becomes eligible.
    fn fresh_attempt(&self, id: &str) {
        self.tracker.reset_cursor(id);
        if let Err(e) = self.marker.clear(id) {
            warn!(task_id = %id, error = %e, "Failed to reset phase marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_value(TaskCommand::SetPrompt {
            id: "fix-pipes".to_string(),
            prompt: "fix them".to_string(),
        })
        .unwrap();
        assert_eq!(json["command"], "set_prompt");
        assert_eq!(json["id"], "fix-pipes");

        let parsed: TaskCommand =
            serde_json::from_str(r#"{"command":"enqueue","spec":{"id":"a","prompt":"x"}}"#)
                .unwrap();
        match parsed {
            TaskCommand::Enqueue { spec } => {
                assert_eq!(spec.id, "a");
                assert_eq!(spec.priority, 10);
            }
            other => panic!("unexpected {other:?}"),
        }

        let parsed: TaskCommand = serde_json::from_str(r#"{"command":"reconcile"}"#).unwrap();
        assert_eq!(parsed, TaskCommand::Reconcile);
        assert_eq!(parsed.task_id(), None);
    }
}
