//! Per-workspace milestone cursor
//!
//! Holds the highest milestone emitted for each workspace and suppresses
//! anything at or below it, so a watcher feeding repeated or out-of-order
//! lines only ever reports forward progress. The cursor map is the only
//! shared state; each watcher touches only its own key.
//!
//! Every reset bumps the workspace's generation. A watcher feeds lines with
//! the generation it started under, so one left over from an earlier attempt
//! cannot advance the new attempt's cursor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::layout::WorkspaceLayout;
use crate::milestone::{match_line, Milestone};
use crate::progress::startup::{recompute_startup_phase, StartupLogs, StartupPhase};

/// Shared reference to a ProgressTracker
pub type SharedProgressTracker = Arc<ProgressTracker>;

#[derive(Debug, Default)]
struct Cursors {
    highest: HashMap<String, Milestone>,
    generations: HashMap<String, u64>,
}

/// Milestone cursor cache plus startup-phase derivation
#[derive(Debug)]
pub struct ProgressTracker {
    cursors: Mutex<Cursors>,
    layout: WorkspaceLayout,
}

impl ProgressTracker {
    pub fn new(layout: WorkspaceLayout) -> Self {
        Self {
            cursors: Mutex::new(Cursors::default()),
            layout,
        }
    }

    pub fn shared(self) -> SharedProgressTracker {
        Arc::new(self)
    }

    fn cursors(&self) -> MutexGuard<'_, Cursors> {
        // A watcher that panicked mid-update leaves a valid map behind
        self.cursors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Feed one line; returns a milestone only if it advances the cursor.
    pub fn observe(&self, workspace_id: &str, line: &str) -> Option<Milestone> {
        let milestone = match_line(line)?;
        let mut cursors = self.cursors();
        Self::advance(&mut cursors, workspace_id, milestone)
    }

    /// Like [`observe`](Self::observe), but ignored once the cursor has been
    /// reset since `generation` was read.
    pub fn observe_in(&self, workspace_id: &str, generation: u64, line: &str) -> Option<Milestone> {
        let milestone = match_line(line)?;
        let mut cursors = self.cursors();
        if cursors.generations.get(workspace_id).copied().unwrap_or(0) != generation {
            return None;
        }
        Self::advance(&mut cursors, workspace_id, milestone)
    }

    fn advance(cursors: &mut Cursors, workspace_id: &str, milestone: Milestone) -> Option<Milestone> {
        let seen = cursors.highest.get(workspace_id).map_or(0, |m| m.rank());
        if milestone.rank() > seen {
            cursors.highest.insert(workspace_id.to_string(), milestone);
            Some(milestone)
        } else {
            None
        }
    }

    /// Feed a batch of lines, returning every milestone that advanced the cursor.
    pub fn observe_all<'a, I>(&self, workspace_id: &str, lines: I) -> Vec<Milestone>
    where
        I: IntoIterator<Item = &'a str>,
    {
        lines
            .into_iter()
            .filter_map(|line| self.observe(workspace_id, line))
            .collect()
    }

    /// Forget the cursor; call on every fresh execution attempt.
    pub fn reset_cursor(&self, workspace_id: &str) {
        let mut cursors = self.cursors();
        cursors.highest.remove(workspace_id);
        *cursors
            .generations
            .entry(workspace_id.to_string())
            .or_insert(0) += 1;
    }

    /// Number of resets so far; pass to [`observe_in`](Self::observe_in).
    pub fn generation(&self, workspace_id: &str) -> u64 {
        self.cursors()
            .generations
            .get(workspace_id)
            .copied()
            .unwrap_or(0)
    }

    /// Highest milestone emitted so far
    pub fn current(&self, workspace_id: &str) -> Option<Milestone> {
        self.cursors().highest.get(workspace_id).copied()
    }

    /// Re-derive the coarse startup phase from the workspace's log files.
    pub fn recompute_startup_phase(&self, workspace_id: &str) -> StartupPhase {
        recompute_startup_phase(&self.startup_logs(workspace_id))
    }

    pub fn startup_logs(&self, workspace_id: &str) -> StartupLogs {
        StartupLogs::new(
            self.layout.build_log_path(workspace_id),
            self.layout.server_log_path(workspace_id),
        )
    }
}
