//! External collaborators at the workspace boundary
//!
//! The engine never provisions containers or runs agents itself. It talks to
//! a [`WorkspaceProvisioner`], an [`AgentRunner`] and a [`LogSource`]; the
//! default implementations shell out to configured command templates
//! ([`script`]) and read per-workspace log files ([`logs`]).

pub mod logs;
pub mod script;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::OrchestratorResult;

pub use logs::{FileLogSource, LogChunk, LogSource, SharedLogSource};
pub use script::{ProvisionerCommands, RunnerCommand, ScriptProvisioner, ScriptRunner};

/// Opaque reference to a materialized workspace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceHandle {
    pub task_id: String,
    /// Workspace directory on the host
    pub path: PathBuf,
    /// Provisioner-specific identifier (container name, VM id, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl WorkspaceHandle {
    pub fn new(task_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            task_id: task_id.into(),
            path: path.into(),
            instance: None,
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

/// Creates, checks and destroys workspaces.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    /// Bring up a workspace for the task. May take minutes.
    async fn materialize(&self, task_id: &str) -> OrchestratorResult<WorkspaceHandle>;

    /// Whether the workspace is still running
    async fn is_alive(&self, handle: &WorkspaceHandle) -> bool;

    async fn tear_down(&self, handle: &WorkspaceHandle) -> OrchestratorResult<()>;

    /// A running workspace for this task that was started outside the
    /// engine, if the provisioner can detect one.
    async fn find_running(&self, _task_id: &str) -> Option<WorkspaceHandle> {
        None
    }
}

/// Starts the autonomous agent inside a workspace. The agent owns the
/// phase marker from then on.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn start(&self, handle: &WorkspaceHandle, prompt: &str) -> OrchestratorResult<()>;
}

pub type SharedProvisioner = Arc<dyn WorkspaceProvisioner>;
pub type SharedRunner = Arc<dyn AgentRunner>;
