//! Workspace filesystem layout
//!
//! Where the engine looks inside a materialized workspace for the phase
//! marker, the todo checklist and the startup logs. Every path is derived
//! from the workspace root plus the task ID, so a restarted orchestrator finds
//! the same files without any in-memory state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Paths inside a workspace, relative to `<root>/<task_id>/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceLayout {
    /// Directory holding one workspace per task ID
    pub root: PathBuf,
    /// Agent-owned task directory (phase marker, todos)
    pub task_dir: PathBuf,
    /// Phase marker file name inside `task_dir`
    pub phase_file: String,
    /// Todo checklist file name inside `task_dir`
    pub todos_file: String,
    /// Build server log, relative to the workspace
    pub build_log: PathBuf,
    /// Application server log, relative to the workspace
    pub server_log: PathBuf,
}

impl Default for WorkspaceLayout {
    fn default() -> Self {
        let root = std::env::var("HOME")
            .map(|home| PathBuf::from(home).join("code").join("workspaces"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/fleet-workspaces"));
        Self::with_root(root)
    }
}

impl WorkspaceLayout {
    /// Default relative paths under the given workspace root
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            task_dir: PathBuf::from(".agent-task"),
            phase_file: "phase".to_string(),
            todos_file: "todos.md".to_string(),
            build_log: PathBuf::from("rundir/logs/build-server.log"),
            server_log: PathBuf::from("rundir/logs/bwdserver.log"),
        }
    }

    pub fn workspace_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.workspace_dir(task_id).join(&self.task_dir)
    }

    pub fn phase_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(&self.phase_file)
    }

    pub fn todos_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(&self.todos_file)
    }

    pub fn build_log_path(&self, task_id: &str) -> PathBuf {
        self.workspace_dir(task_id).join(&self.build_log)
    }

    pub fn server_log_path(&self, task_id: &str) -> PathBuf {
        self.workspace_dir(task_id).join(&self.server_log)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_derived_from_task_id() {
        let layout = WorkspaceLayout::with_root("/srv/ws");
        assert_eq!(
            layout.phase_path("fix-pipes"),
            PathBuf::from("/srv/ws/fix-pipes/.agent-task/phase")
        );
        assert_eq!(
            layout.todos_path("fix-pipes"),
            PathBuf::from("/srv/ws/fix-pipes/.agent-task/todos.md")
        );
        assert_eq!(
            layout.build_log_path("fix-pipes"),
            PathBuf::from("/srv/ws/fix-pipes/rundir/logs/build-server.log")
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let layout: WorkspaceLayout = toml::from_str(r#"root = "/data/ws""#).unwrap();
        assert_eq!(layout.root, PathBuf::from("/data/ws"));
        assert_eq!(layout.phase_file, "phase");
    }
}
