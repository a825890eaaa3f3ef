//! Plain-text views for the terminal

use coordination::{HealthIssue, StatusSnapshot, TaskStatus, TickReport};
use std::fmt::Write;

/// Queue table, optionally limited to one status.
pub fn task_table(snapshot: &StatusSnapshot, filter: Option<TaskStatus>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}/{} running  (snapshot {})",
        snapshot.running,
        snapshot.capacity,
        snapshot.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let tasks: Vec<_> = snapshot
        .tasks
        .iter()
        .filter(|t| filter.map_or(true, |status| t.status == status))
        .collect();
    if tasks.is_empty() {
        out.push_str("No tasks\n");
        return out;
    }

    let id_width = tasks.iter().map(|t| t.id.len()).max().unwrap_or(2).max(2);
    let _ = writeln!(
        out,
        "  {:<12} {:<id_width$} {:>4}  {:<16} PROGRESS",
        "STATUS", "ID", "PRI", "PHASE"
    );
    for task in tasks {
        let status = format!("{} {}", task.status.icon(), task.status.label());
        let _ = write!(
            out,
            "  {:<12} {:<id_width$} {:>4}  {:<16} {}",
            status,
            task.id,
            task.priority,
            task.phase.label(),
            task.progress_text()
        );
        if let Some(error) = &task.last_error {
            let _ = write!(out, "  [{error}]");
        }
        out.push('\n');
    }
    out
}

pub fn health_report(issues: &[HealthIssue]) -> String {
    if issues.is_empty() {
        return "No issues found\n".to_string();
    }
    let mut out = String::new();
    for issue in issues {
        let _ = writeln!(
            out,
            "[{}] {}: {} (suggested: {})",
            issue.severity, issue.task_id, issue.message, issue.action
        );
    }
    out
}

pub fn tick_summary(report: &TickReport) -> String {
    let mut out = format!(
        "capacity {}, {} command(s) applied\n",
        report.capacity, report.commands
    );
    for (label, ids) in [
        ("admitted", &report.admitted),
        ("adopted", &report.adopted),
        ("completed", &report.completed),
        ("waiting", &report.waiting),
        ("lost", &report.lost),
    ] {
        if !ids.is_empty() {
            let _ = writeln!(out, "{label}: {}", ids.join(", "));
        }
    }
    out
}
