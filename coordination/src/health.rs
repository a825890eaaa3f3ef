//! Read-only health check over the queue
//!
//! Compares each task record against its workspace (liveness, phase marker,
//! log tail) and reports inconsistencies with a suggested operator action.
//! Nothing here mutates state; the engine's reconciliation does that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::phase::{Phase, PhaseMarker};
use crate::task::{TaskRecord, TaskStatus};
use crate::workspace::{LogSource, WorkspaceProvisioner};

/// Log-tail phrases that mean the agent is blocked on credentials or quota
const STUCK_KEYWORDS: &[&str] = &[
    "invalid api key",
    "authentication failed",
    "unauthorized",
    "auth conflict",
    "platform.claude.com/oauth",
    "paste code here",
    "rate limit",
    "too many requests",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// What the operator should do about an issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthAction {
    /// Reset the task so it is admitted again
    Restart,
    /// Run a reconciliation pass
    Sync,
    /// Fix the agent's problem, then retry
    Fix,
    /// Look at the workspace
    Check,
}

impl fmt::Display for HealthAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restart => write!(f, "restart"),
            Self::Sync => write!(f, "sync"),
            Self::Fix => write!(f, "fix"),
            Self::Check => write!(f, "check"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub task_id: String,
    pub severity: Severity,
    pub message: String,
    pub action: HealthAction,
}

impl HealthIssue {
    fn new(task_id: &str, severity: Severity, message: impl Into<String>, action: HealthAction) -> Self {
        Self {
            task_id: task_id.to_string(),
            severity,
            message: message.into(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Running longer than this is reported
    pub stale_running_secs: u64,
    /// How much of the end of the workspace log to scan for stuck keywords
    pub log_tail_bytes: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            stale_running_secs: 4 * 60 * 60,
            log_tail_bytes: 8 * 1024,
        }
    }
}

/// Everything known about one task at check time
#[derive(Debug, Clone)]
pub struct TaskObservation<'a> {
    pub task: &'a TaskRecord,
    pub phase: Phase,
    /// `None` when liveness was not checked
    pub alive: Option<bool>,
    pub log_tail: &'a str,
}

/// Agent output suggests it is blocked on auth or rate limits.
pub fn is_agent_stuck(log_tail: &str) -> bool {
    let lower = log_tail.to_lowercase();
    STUCK_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Pure check of one task.
pub fn check_task(obs: &TaskObservation<'_>, settings: &HealthSettings, now: DateTime<Utc>) -> Vec<HealthIssue> {
    let task = obs.task;
    let mut issues = Vec::new();
    let running = task.status == TaskStatus::Running;

    if running && obs.alive == Some(false) {
        issues.push(HealthIssue::new(
            &task.id,
            Severity::Warning,
            "Marked as running but workspace is stopped",
            HealthAction::Restart,
        ));
    }

    if running && is_agent_stuck(obs.log_tail) {
        issues.push(HealthIssue::new(
            &task.id,
            Severity::Warning,
            "Agent may be stuck (auth issue, rate limit or waiting for input)",
            HealthAction::Check,
        ));
    }

    if obs.phase == Phase::Done && task.status != TaskStatus::Done {
        issues.push(HealthIssue::new(
            &task.id,
            Severity::Info,
            format!("Phase is done but status is {}", task.status),
            HealthAction::Sync,
        ));
    }

    if matches!(obs.phase, Phase::AuthError | Phase::Error | Phase::MaxIterations) {
        issues.push(HealthIssue::new(
            &task.id,
            Severity::Error,
            format!("Task in error state: {}", obs.phase.as_str()),
            HealthAction::Fix,
        ));
    }

    if running {
        if let Some(started) = task.started_at {
            let running_for = now.signed_duration_since(started);
            if running_for.num_seconds() > settings.stale_running_secs as i64 {
                issues.push(HealthIssue::new(
                    &task.id,
                    Severity::Warning,
                    format!(
                        "Running for {}h{:02}m without completion",
                        running_for.num_hours(),
                        running_for.num_minutes() % 60
                    ),
                    HealthAction::Check,
                ));
            }
        }
    }

    issues
}

/// Last `bytes` of a workspace log, empty if unreadable.
pub fn log_tail(logs: &dyn LogSource, workspace_id: &str, bytes: u64) -> String {
    let end = logs.end_offset(workspace_id).unwrap_or(0);
    logs.read_from(workspace_id, end.saturating_sub(bytes))
        .map(|chunk| chunk.lines.join("\n"))
        .unwrap_or_default()
}

/// Check every task, probing liveness only for Running tasks.
pub async fn run_health_check(
    tasks: &[&TaskRecord],
    marker: &PhaseMarker,
    provisioner: &dyn WorkspaceProvisioner,
    logs: &dyn LogSource,
    settings: &HealthSettings,
) -> Vec<HealthIssue> {
    let now = Utc::now();
    let mut issues = Vec::new();

    for task in tasks {
        let running = task.status == TaskStatus::Running;
        let alive = if running {
            Some(match &task.workspace {
                Some(handle) => provisioner.is_alive(handle).await,
                None => provisioner.find_running(&task.id).await.is_some(),
            })
        } else {
            None
        };
        let tail = if running {
            log_tail(logs, &task.id, settings.log_tail_bytes)
        } else {
            String::new()
        };
        let obs = TaskObservation {
            task,
            phase: marker.read(&task.id),
            alive,
            log_tail: &tail,
        };
        issues.extend(check_task(&obs, settings, now));
    }

    issues.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.task_id.cmp(&b.task_id)));
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskSpec, TransitionCause};
    use chrono::Duration;

    fn running_task() -> TaskRecord {
        let mut task = TaskRecord::new(TaskSpec::new("fix-pipes", "x", 1), 0);
        task.transition(TaskStatus::Running, TransitionCause::Admitted)
            .unwrap();
        task
    }

    fn observe(task: &TaskRecord, phase: Phase, alive: Option<bool>, tail: &str) -> Vec<HealthIssue> {
        let obs = TaskObservation {
            task,
            phase,
            alive,
            log_tail: tail,
        };
        check_task(&obs, &HealthSettings::default(), Utc::now())
    }

    #[test]
    fn test_healthy_running_task() {
        let task = running_task();
        assert!(observe(&task, Phase::Executing, Some(true), "compiling...").is_empty());
    }

    #[test]
    fn test_dead_workspace() {
        let task = running_task();
        let issues = observe(&task, Phase::Executing, Some(false), "");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].action, HealthAction::Restart);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_done_phase_not_reflected() {
        let task = running_task();
        let issues = observe(&task, Phase::Done, Some(true), "");
        assert_eq!(issues[0].action, HealthAction::Sync);
    }

    #[test]
    fn test_error_phases() {
        let mut task = running_task();
        task.status = TaskStatus::Waiting;
        for phase in [Phase::AuthError, Phase::Error, Phase::MaxIterations] {
            let issues = observe(&task, phase, None, "");
            assert_eq!(issues.len(), 1, "{phase:?}");
            assert_eq!(issues[0].severity, Severity::Error);
            assert!(issues[0].message.contains(phase.as_str()));
        }
        assert!(observe(&task, Phase::AwaitingAnswers, None, "").is_empty());
    }

    #[test]
    fn test_stale_running() {
        let mut task = running_task();
        task.started_at = Some(Utc::now() - Duration::hours(5));
        let issues = observe(&task, Phase::Executing, Some(true), "");
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.starts_with("Running for 5h"));
    }

    #[test]
    fn test_stuck_keywords() {
        assert!(is_agent_stuck("Error: Invalid API key provided"));
        assert!(is_agent_stuck("429 Too Many Requests"));
        assert!(is_agent_stuck("Paste code here if prompted >"));
        assert!(!is_agent_stuck("Build succeeded."));

        let task = running_task();
        let issues = observe(&task, Phase::Executing, Some(true), "rate limit exceeded");
        assert_eq!(issues[0].action, HealthAction::Check);
    }
}
