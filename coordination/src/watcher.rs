//! Per-workspace log watchers
//!
//! One tokio task per running workspace polls its [`LogSource`] and feeds new
//! lines to the shared [`ProgressTracker`]. Each watcher only ever touches its
//! own workspace's cursor, and each has its own cancellation token so a single
//! workspace can be stopped without disturbing the rest.

use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::milestone::parse_build_step;
use crate::progress::SharedProgressTracker;
use crate::workspace::SharedLogSource;

/// Where a new watcher starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchFrom {
    /// Replay the whole log (recovering after an orchestrator restart)
    Beginning,
    /// Skip output of earlier attempts
    End,
}

struct Watcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
}

/// Owns every running watcher, keyed by workspace ID
pub struct WatcherSet {
    tracker: SharedProgressTracker,
    logs: SharedLogSource,
    poll_interval: Duration,
    parent: CancellationToken,
    watchers: HashMap<String, Watcher>,
}

impl WatcherSet {
    pub fn new(
        tracker: SharedProgressTracker,
        logs: SharedLogSource,
        poll_interval: Duration,
        parent: CancellationToken,
    ) -> Self {
        Self {
            tracker,
            logs,
            poll_interval,
            parent,
            watchers: HashMap::new(),
        }
    }

    /// Start a watcher unless one is already running for this workspace's
    /// current attempt.
    pub fn ensure(&mut self, workspace_id: &str, from: WatchFrom) {
        let generation = self.tracker.generation(workspace_id);
        if let Some(existing) = self.watchers.get(workspace_id) {
            if !existing.handle.is_finished() && existing.generation == generation {
                return;
            }
            self.stop(workspace_id);
        }

        let offset = match from {
            WatchFrom::Beginning => 0,
            WatchFrom::End => self.logs.end_offset(workspace_id).unwrap_or_else(|e| {
                warn!(workspace = workspace_id, error = %e, "Failed to stat log, reading from start");
                0
            }),
        };

        let cancel = self.parent.child_token();
        let handle = tokio::spawn(watch_log(
            workspace_id.to_string(),
            offset,
            generation,
            self.tracker.clone(),
            self.logs.clone(),
            self.poll_interval,
            cancel.clone(),
        ));
        debug!(workspace = workspace_id, offset, generation, "Log watcher started");
        self.watchers.insert(
            workspace_id.to_string(),
            Watcher {
                cancel,
                handle,
                generation,
            },
        );
    }

    pub fn stop(&mut self, workspace_id: &str) {
        if let Some(watcher) = self.watchers.remove(workspace_id) {
            watcher.cancel.cancel();
            watcher.handle.abort();
            debug!(workspace = workspace_id, "Log watcher stopped");
        }
    }

    /// Stop every watcher whose workspace is not in `keep`.
    pub fn retain(&mut self, keep: &[String]) {
        let stale: Vec<String> = self
            .watchers
            .keys()
            .filter(|id| !keep.contains(id))
            .cloned()
            .collect();
        for id in stale {
            self.stop(&id);
        }
    }

    pub fn is_watching(&self, workspace_id: &str) -> bool {
        self.watchers
            .get(workspace_id)
            .is_some_and(|w| !w.handle.is_finished())
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Cancel every watcher and wait for them to exit.
    pub async fn shutdown(&mut self) {
        for (_, watcher) in self.watchers.drain() {
            watcher.cancel.cancel();
            let _ = watcher.handle.await;
        }
    }
}

/// Poll one log until cancelled.
async fn watch_log(
    workspace_id: String,
    mut offset: u64,
    generation: u64,
    tracker: SharedProgressTracker,
    logs: SharedLogSource,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        match logs.read_from(&workspace_id, offset) {
            Ok(chunk) => {
                for line in &chunk.lines {
                    if cancel.is_cancelled() {
                        return;
                    }
                    if let Some(step) = parse_build_step(line) {
                        debug!(workspace = %workspace_id, step = %step, "Image build step");
                    }
                    if let Some(milestone) = tracker.observe_in(&workspace_id, generation, line) {
                        info!(
                            workspace = %workspace_id,
                            milestone = %milestone,
                            rank = milestone.rank(),
                            "Milestone reached"
                        );
                    }
                }
                offset = chunk.next_offset;
            }
            Err(e) => {
                warn!(workspace = %workspace_id, error = %e, "Failed to read workspace log");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}
