//! Command-template provisioner and agent runner
//!
//! Each operation is a shell-style command template. `{id}`, `{workspace}`
//! and (for the runner) `{prompt_file}` are substituted with quoted values,
//! then the template is split with `shlex` and executed directly, without a
//! shell. Output of materialize, teardown and runner commands is appended to
//! the workspace's log file so the watcher can infer milestones from it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::logs::log_path;
use super::{AgentRunner, WorkspaceHandle, WorkspaceProvisioner};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::layout::WorkspaceLayout;

/// Provisioner command templates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerCommands {
    pub materialize: String,
    /// Exit status 0 means alive. Without a template, a workspace is alive
    /// while its directory exists.
    pub is_alive: Option<String>,
    pub tear_down: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ProvisionerCommands {
    fn default() -> Self {
        Self {
            materialize: "devcontainer up --workspace-folder {workspace}".to_string(),
            is_alive: Some(
                "sh -c 'docker ps -q --filter label=devcontainer.local_folder=\"$1\" | grep -q .' _ {workspace}"
                    .to_string(),
            ),
            tear_down: Some(
                "sh -c 'docker ps -q --filter label=devcontainer.local_folder=\"$1\" | xargs -r docker stop' _ {workspace}"
                    .to_string(),
            ),
            timeout_secs: 1800,
        }
    }
}

/// Agent runner command template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerCommand {
    pub start: String,
    pub timeout_secs: u64,
}

impl Default for RunnerCommand {
    fn default() -> Self {
        Self {
            start: "devcontainer exec --workspace-folder {workspace} agent-loop --prompt-file {prompt_file}"
                .to_string(),
            timeout_secs: 120,
        }
    }
}

/// Substitute `{key}` placeholders with shell-quoted values and split into argv.
pub fn render_command(template: &str, vars: &[(&str, &str)]) -> OrchestratorResult<Vec<String>> {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        let quoted = shlex::try_quote(value).map_err(|e| {
            OrchestratorError::validation(format!("cannot quote {key} value {value:?}: {e}"))
        })?;
        rendered = rendered.replace(&format!("{{{key}}}"), &quoted);
    }
    let argv = shlex::split(&rendered).ok_or_else(|| {
        OrchestratorError::config(format!("unbalanced quoting in command template: {template}"))
    })?;
    if argv.is_empty() {
        return Err(OrchestratorError::config("empty command template"));
    }
    Ok(argv)
}

/// Outcome of one templated command
#[derive(Debug)]
struct CommandOutcome {
    success: bool,
    description: String,
}

/// Run argv to completion with stdout/stderr appended to `log`.
async fn run_logged(
    argv: &[String],
    cwd: Option<&Path>,
    log: Option<&Path>,
    timeout: Duration,
    envs: &[(&str, &str)],
) -> std::io::Result<CommandOutcome> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]).kill_on_drop(true).stdin(Stdio::null());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in envs {
        cmd.env(key, value);
    }
    match log {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let out = OpenOptions::new().create(true).append(true).open(path)?;
            let err = out.try_clone()?;
            cmd.stdout(out).stderr(err);
        }
        None => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    let mut child = cmd.spawn()?;
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status?;
            Ok(CommandOutcome {
                success: status.success(),
                description: match status.code() {
                    Some(code) => format!("{} exited with status {code}", argv[0]),
                    None => format!("{} terminated by signal", argv[0]),
                },
            })
        }
        Err(_) => {
            let _ = child.kill().await;
            Ok(CommandOutcome {
                success: false,
                description: format!("{} timed out after {}s", argv[0], timeout.as_secs()),
            })
        }
    }
}

// ============================================================================
// Provisioner
// ============================================================================

pub struct ScriptProvisioner {
    commands: ProvisionerCommands,
    layout: WorkspaceLayout,
    log_dir: PathBuf,
}

impl ScriptProvisioner {
    pub fn new(commands: ProvisionerCommands, layout: WorkspaceLayout, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            commands,
            layout,
            log_dir: log_dir.into(),
        }
    }

    fn handle_for(&self, task_id: &str) -> WorkspaceHandle {
        WorkspaceHandle::new(task_id, self.layout.workspace_dir(task_id))
    }

    fn vars<'a>(handle: &'a WorkspaceHandle, workspace: &'a str) -> [(&'static str, &'a str); 2] {
        [("id", handle.task_id.as_str()), ("workspace", workspace)]
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.commands.timeout_secs.max(1))
    }
}

#[async_trait]
impl WorkspaceProvisioner for ScriptProvisioner {
    async fn materialize(&self, task_id: &str) -> OrchestratorResult<WorkspaceHandle> {
        let handle = self.handle_for(task_id);
        std::fs::create_dir_all(&handle.path)
            .map_err(|e| OrchestratorError::provision(task_id, e.to_string()))?;

        let workspace = handle.path.to_string_lossy().into_owned();
        let argv = render_command(&self.commands.materialize, &Self::vars(&handle, &workspace))?;
        let log = log_path(&self.log_dir, task_id);
        info!(task_id, command = %argv.join(" "), "Materializing workspace");

        let outcome = run_logged(&argv, Some(&handle.path), Some(&log), self.timeout(), &[])
            .await
            .map_err(|e| OrchestratorError::provision(task_id, format!("{}: {e}", argv[0])))?;
        if !outcome.success {
            return Err(OrchestratorError::provision(task_id, outcome.description));
        }
        Ok(handle)
    }

    async fn is_alive(&self, handle: &WorkspaceHandle) -> bool {
        let Some(template) = &self.commands.is_alive else {
            return handle.path.is_dir();
        };
        let workspace = handle.path.to_string_lossy().into_owned();
        let argv = match render_command(template, &Self::vars(handle, &workspace)) {
            Ok(argv) => argv,
            Err(e) => {
                warn!(task_id = %handle.task_id, error = %e, "Bad liveness command");
                return false;
            }
        };
        match run_logged(&argv, None, None, Duration::from_secs(30), &[]).await {
            Ok(outcome) => outcome.success,
            Err(e) => {
                warn!(task_id = %handle.task_id, error = %e, "Liveness check failed to run");
                false
            }
        }
    }

    async fn tear_down(&self, handle: &WorkspaceHandle) -> OrchestratorResult<()> {
        let Some(template) = &self.commands.tear_down else {
            debug!(task_id = %handle.task_id, "No teardown command configured");
            return Ok(());
        };
        let workspace = handle.path.to_string_lossy().into_owned();
        let argv = render_command(template, &Self::vars(handle, &workspace))?;
        let log = log_path(&self.log_dir, &handle.task_id);
        let outcome = run_logged(&argv, None, Some(&log), self.timeout(), &[])
            .await
            .map_err(|e| OrchestratorError::teardown(&handle.task_id, e.to_string()))?;
        if !outcome.success {
            return Err(OrchestratorError::teardown(&handle.task_id, outcome.description));
        }
        info!(task_id = %handle.task_id, "Workspace torn down");
        Ok(())
    }

    async fn find_running(&self, task_id: &str) -> Option<WorkspaceHandle> {
        let handle = self.handle_for(task_id);
        if !handle.path.is_dir() {
            return None;
        }
        // Without a liveness command an existing directory proves nothing
        self.commands.is_alive.as_ref()?;
        if self.is_alive(&handle).await {
            Some(handle)
        } else {
            None
        }
    }
}

// ============================================================================
// Agent runner
// ============================================================================

/// Writes the prompt into the workspace task directory and runs the start
/// command, which is expected to launch the agent and return.
pub struct ScriptRunner {
    command: RunnerCommand,
    layout: WorkspaceLayout,
    log_dir: PathBuf,
}

impl ScriptRunner {
    pub fn new(command: RunnerCommand, layout: WorkspaceLayout, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            layout,
            log_dir: log_dir.into(),
        }
    }

    pub fn prompt_path(&self, task_id: &str) -> PathBuf {
        self.layout.task_dir(task_id).join("prompt.md")
    }
}

#[async_trait]
impl AgentRunner for ScriptRunner {
    async fn start(&self, handle: &WorkspaceHandle, prompt: &str) -> OrchestratorResult<()> {
        let task_id = handle.task_id.as_str();
        let prompt_file = self.prompt_path(task_id);
        if let Some(parent) = prompt_file.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OrchestratorError::runner(task_id, e.to_string()))?;
        }
        std::fs::write(&prompt_file, prompt)
            .map_err(|e| OrchestratorError::runner(task_id, e.to_string()))?;

        let workspace = handle.path.to_string_lossy().into_owned();
        let prompt_file_str = prompt_file.to_string_lossy().into_owned();
        let argv = render_command(
            &self.command.start,
            &[
                ("id", task_id),
                ("workspace", &workspace),
                ("prompt_file", &prompt_file_str),
            ],
        )?;
        let log = log_path(&self.log_dir, task_id);
        info!(task_id, command = %argv.join(" "), "Starting agent");

        let outcome = run_logged(
            &argv,
            Some(&handle.path),
            Some(&log),
            Duration::from_secs(self.command.timeout_secs.max(1)),
            &[("FLEET_TASK_ID", task_id)],
        )
        .await
        .map_err(|e| OrchestratorError::runner(task_id, format!("{}: {e}", argv[0])))?;
        if !outcome.success {
            return Err(OrchestratorError::runner(task_id, outcome.description));
        }
        Ok(())
    }
}
