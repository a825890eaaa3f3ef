//! Orchestrator error types
//!
//! One error enum for the engine, with constructor helpers for the variants
//! that carry context. Store-level failures live in [`crate::store::StoreError`]
//! and convert into [`OrchestratorError`] with `?`.

use std::path::PathBuf;
use thiserror::Error;

use crate::store::StoreError;
use crate::task::TaskStatus;

/// Result type alias for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors that can occur while queueing, admitting or reconciling tasks
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// No task record with this ID
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// A status change that the lifecycle does not allow
    #[error("Invalid status transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Workspace could not be materialized
    #[error("Provisioning failed for {task_id}: {message}")]
    Provision { task_id: String, message: String },

    /// Workspace teardown failed
    #[error("Teardown failed for {task_id}: {message}")]
    Teardown { task_id: String, message: String },

    /// Agent could not be started inside a workspace
    #[error("Agent runner failed for {task_id}: {message}")]
    Runner { task_id: String, message: String },

    /// Phase marker text did not name a known phase
    #[error("Unrecognized phase marker: {value:?}")]
    InvalidPhase { value: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Configuration file could not be parsed
    #[error("Invalid config file {path}: {message}")]
    ConfigFile { path: PathBuf, message: String },

    /// Validation error (for invalid operator input)
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// The control loop is no longer accepting commands
    #[error("Engine has shut down")]
    EngineStopped,

    /// Persistence failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn task_not_found(task_id: impl Into<String>) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    pub fn invalid_transition(task_id: impl Into<String>, from: TaskStatus, to: TaskStatus) -> Self {
        Self::InvalidTransition {
            task_id: task_id.into(),
            from,
            to,
        }
    }

    pub fn provision(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provision {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    pub fn teardown(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Teardown {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    pub fn runner(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Runner {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation on a later tick can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provision { .. } | Self::Runner { .. } | Self::Io(_)
        )
    }
}
