//! Control loop: admission, reconciliation, materialization
//!
//! A single [`Engine`] owns the task queue and drives every status change.
//! Each tick it drains the command inbox, collects finished materializations,
//! reconciles Running tasks against their phase marker and workspace
//! liveness, adopts manually started workspaces, admits Ready tasks up to the
//! capacity ceiling, and writes a status snapshot.
//!
//! Materialization and teardown are spawned onto join sets and never awaited
//! on the loop. A task with a materialization in flight is neither
//! reconciled nor re-admitted until the job reports back.

pub mod commands;
pub mod inbox;
pub mod snapshot;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capacity::{CapacityPolicy, HostProbe};
use crate::error::OrchestratorResult;
use crate::health::{run_health_check, HealthIssue, HealthSettings};
use crate::notify::Notifier;
use crate::phase::{Phase, SharedPhaseMarker};
use crate::progress::SharedProgressTracker;
use crate::queue::TaskQueue;
use crate::task::{TaskStatus, TransitionCause};
use crate::watcher::{WatchFrom, WatcherSet};
use crate::workspace::{SharedLogSource, SharedProvisioner, SharedRunner, WorkspaceHandle};

pub use commands::{EngineCommand, EngineHandle, TaskCommand};
pub use inbox::CommandInbox;
pub use snapshot::{StatusSnapshot, TaskView};

/// Error recorded when a Running task's workspace disappears
pub const WORKSPACE_LOST: &str = "workspace lost";

/// Error recorded when a materialization job panics
pub const MATERIALIZE_PANICKED: &str = "materialization panicked";

/// Loop timing and feature switches
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub tick_interval: Duration,
    pub log_poll_interval: Duration,
    pub capacity: CapacityPolicy,
    pub health: HealthSettings,
    /// Adopt Ready tasks whose workspace was started outside the engine
    pub adopt_manual_starts: bool,
    /// Where `status.json` is written after each tick
    pub snapshot_path: Option<PathBuf>,
    /// Durable command inbox directory
    pub inbox_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            log_poll_interval: Duration::from_secs(1),
            capacity: CapacityPolicy::default(),
            health: HealthSettings::default(),
            adopt_manual_starts: true,
            snapshot_path: None,
            inbox_dir: None,
        }
    }
}

/// Collaborators injected into the engine
pub struct EngineDeps {
    pub queue: TaskQueue,
    pub tracker: SharedProgressTracker,
    pub marker: SharedPhaseMarker,
    pub provisioner: SharedProvisioner,
    pub runner: SharedRunner,
    pub logs: SharedLogSource,
    pub probe: Arc<dyn HostProbe>,
    pub notifier: Option<Notifier>,
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub commands: usize,
    pub capacity: usize,
    pub admitted: Vec<String>,
    pub adopted: Vec<String>,
    pub completed: Vec<String>,
    pub waiting: Vec<String>,
    pub lost: Vec<String>,
}

/// Result of one spawned materialization
struct Materialized {
    task_id: String,
    result: OrchestratorResult<WorkspaceHandle>,
}

pub struct Engine {
    queue: TaskQueue,
    tracker: SharedProgressTracker,
    marker: SharedPhaseMarker,
    provisioner: SharedProvisioner,
    runner: SharedRunner,
    logs: SharedLogSource,
    probe: Arc<dyn HostProbe>,
    notifier: Option<Notifier>,
    settings: EngineSettings,
    inbox: Option<CommandInbox>,
    watchers: WatcherSet,
    materializing: HashSet<String>,
    jobs: JoinSet<Materialized>,
    /// Task behind each in-flight job, for jobs that panic
    job_tasks: HashMap<Id, String>,
    background: JoinSet<()>,
    commands: mpsc::Receiver<EngineCommand>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(deps: EngineDeps, settings: EngineSettings) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let watchers = WatcherSet::new(
            deps.tracker.clone(),
            deps.logs.clone(),
            settings.log_poll_interval,
            cancel.child_token(),
        );
        let engine = Self {
            queue: deps.queue,
            tracker: deps.tracker,
            marker: deps.marker,
            provisioner: deps.provisioner,
            runner: deps.runner,
            logs: deps.logs,
            probe: deps.probe,
            notifier: deps.notifier,
            inbox: settings.inbox_dir.clone().map(CommandInbox::new),
            settings,
            watchers,
            materializing: HashSet::new(),
            jobs: JoinSet::new(),
            job_tasks: HashMap::new(),
            background: JoinSet::new(),
            commands: rx,
            cancel,
        };
        (engine, EngineHandle::new(tx))
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn tracker(&self) -> &SharedProgressTracker {
        &self.tracker
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_materializing(&self, id: &str) -> bool {
        self.materializing.contains(id)
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity.capacity_for(self.probe.as_ref())
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Run until cancelled or a Shutdown command arrives.
    pub async fn run(mut self) -> OrchestratorResult<()> {
        let recovered = self.queue.count_running();
        info!(
            tasks = self.queue.len(),
            running = recovered,
            capacity = self.capacity(),
            "Engine starting"
        );
        if recovered > 0 {
            info!(running = recovered, "Reconciling tasks left running by a previous process");
        }

        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Tick failed");
                    }
                }
                Some(command) = self.commands.recv() => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(joined) = self.jobs.join_next(), if !self.jobs.is_empty() => {
                    self.on_materialized(joined);
                }
            }
        }

        info!("Engine stopping");
        self.cancel.cancel();
        self.watchers.shutdown().await;
        self.write_snapshot();
        Ok(())
    }

    /// Returns false when the loop should stop.
    async fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Apply { command, reply } => {
                let result = self.apply(command).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Command failed");
                }
                let _ = reply.send(result);
                true
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                true
            }
            EngineCommand::Health { reply } => {
                let _ = reply.send(self.health_check().await);
                true
            }
            EngineCommand::Shutdown => false,
        }
    }

    /// One processing cycle.
    pub async fn tick(&mut self) -> OrchestratorResult<TickReport> {
        let mut report = TickReport {
            commands: self.drain_inbox().await,
            ..Default::default()
        };

        while let Some(joined) = self.jobs.try_join_next() {
            self.on_materialized(joined);
        }
        while let Some(joined) = self.background.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "Background job panicked");
            }
        }

        self.reconcile_into(&mut report).await?;

        report.capacity = self.capacity();
        if self.settings.adopt_manual_starts {
            report.adopted = self.adopt_manual_starts(report.capacity).await?;
        }
        report.admitted = self.admit(report.capacity)?;

        self.sync_watchers();
        self.write_snapshot();

        if !report.admitted.is_empty() || !report.completed.is_empty() || !report.lost.is_empty() {
            info!(
                capacity = report.capacity,
                running = self.queue.count_running(),
                admitted = report.admitted.len(),
                completed = report.completed.len(),
                waiting = report.waiting.len(),
                lost = report.lost.len(),
                "Tick processed"
            );
        }
        Ok(report)
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Reconcile every Running task now.
    pub async fn reconcile(&mut self) -> OrchestratorResult<()> {
        let mut report = TickReport::default();
        self.reconcile_into(&mut report).await
    }

    async fn reconcile_into(&mut self, report: &mut TickReport) -> OrchestratorResult<()> {
        for id in self.queue.ids_with_status(TaskStatus::Running) {
            if self.materializing.contains(&id) {
                continue;
            }

            let phase = self.marker.read(&id);
            if phase.is_settled() {
                self.apply_phase(&id, phase, report)?;
                continue;
            }

            let handle = self.queue.get(&id).and_then(|t| t.workspace.clone());
            let alive = match &handle {
                Some(handle) => self.provisioner.is_alive(handle).await,
                None => match self.provisioner.find_running(&id).await {
                    Some(found) => {
                        info!(task_id = %id, path = %found.path.display(), "Recovered workspace handle");
                        self.queue.update(&id, |task| {
                            task.workspace = Some(found);
                            Ok(())
                        })?;
                        true
                    }
                    None => false,
                },
            };

            if !alive {
                warn!(task_id = %id, phase = %phase, "Running task lost its workspace");
                self.queue.update(&id, |task| {
                    task.transition(TaskStatus::Waiting, TransitionCause::WorkspaceLost)?;
                    task.last_error = Some(WORKSPACE_LOST.to_string());
                    Ok(())
                })?;
                self.watchers.stop(&id);
                self.notify_waiting(&id, phase);
                report.lost.push(id);
            }
        }
        Ok(())
    }

    /// Propagate a settled phase into the task status.
    fn apply_phase(&mut self, id: &str, phase: Phase, report: &mut TickReport) -> OrchestratorResult<()> {
        if phase == Phase::Done {
            let handle = self.queue.update(id, |task| {
                task.transition(TaskStatus::Done, TransitionCause::PhaseSettled)?;
                Ok(task.workspace.clone())
            })?;
            info!(task_id = %id, "Task done");
            self.watchers.stop(id);
            if let Some(handle) = handle {
                self.spawn_teardown(handle);
            }
            report.completed.push(id.to_string());
            return Ok(());
        }

        let message = phase.failure_message().map(str::to_string);
        self.queue.update(id, |task| {
            task.transition(TaskStatus::Waiting, TransitionCause::PhaseSettled)?;
            if message.is_some() {
                task.last_error = message.clone();
            }
            Ok(())
        })?;
        info!(task_id = %id, phase = %phase, "Task waiting");
        self.watchers.stop(id);
        self.notify_waiting(id, phase);
        report.waiting.push(id.to_string());
        Ok(())
    }

    fn notify_waiting(&self, id: &str, phase: Phase) {
        if let (Some(notifier), Some(task)) = (&self.notifier, self.queue.get(id)) {
            notifier.task_waiting(task, phase);
        }
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Adopt Ready tasks whose workspace is already running.
    async fn adopt_manual_starts(&mut self, capacity: usize) -> OrchestratorResult<Vec<String>> {
        let mut adopted = Vec::new();
        for id in self.queue.ids_with_status(TaskStatus::Ready) {
            if self.queue.count_running() >= capacity {
                break;
            }
            if self.materializing.contains(&id) {
                continue;
            }
            let Some(handle) = self.provisioner.find_running(&id).await else {
                continue;
            };
            self.queue.update(&id, |task| {
                task.transition(TaskStatus::Running, TransitionCause::Adopted)?;
                task.workspace = Some(handle);
                Ok(())
            })?;
            info!(task_id = %id, "Adopted manually started workspace");
            self.watchers.ensure(&id, WatchFrom::Beginning);
            adopted.push(id);
        }
        Ok(adopted)
    }

    /// Admit Ready tasks in priority order while slots are free.
    fn admit(&mut self, capacity: usize) -> OrchestratorResult<Vec<String>> {
        let mut admitted = Vec::new();
        while self.queue.count_running() < capacity {
            let exclude: Vec<String> = self.materializing.iter().cloned().collect();
            let Some(task) = self.queue.next_ready(&exclude) else {
                break;
            };
            let id = task.id.clone();
            let prompt = task.prompt.clone();

            self.tracker.reset_cursor(&id);
            if let Err(e) = self.marker.clear(&id) {
                warn!(task_id = %id, error = %e, "Failed to reset phase marker");
            }
            self.queue.update(&id, |task| {
                task.transition(TaskStatus::Running, TransitionCause::Admitted)?;
                task.workspace = None;
                Ok(())
            })?;
            info!(task_id = %id, capacity, "Task admitted");

            self.watchers.ensure(&id, WatchFrom::End);
            self.materializing.insert(id.clone());
            let job = self.jobs.spawn(materialize(
                id.clone(),
                prompt,
                self.provisioner.clone(),
                self.runner.clone(),
                self.marker.clone(),
            ));
            self.job_tasks.insert(job.id(), id.clone());
            admitted.push(id);
        }
        Ok(admitted)
    }

    fn on_materialized(&mut self, joined: Result<Materialized, JoinError>) {
        let Materialized { task_id, result } = match joined {
            Ok(done) => done,
            Err(e) => {
                let Some(task_id) = self.job_tasks.remove(&e.id()) else {
                    error!(error = %e, "Materialization job failed for an unknown task");
                    return;
                };
                error!(task_id = %task_id, error = %e, "Materialization job panicked");
                self.materializing.remove(&task_id);
                if self
                    .queue
                    .get(&task_id)
                    .is_some_and(|t| t.status == TaskStatus::Running)
                {
                    self.return_to_queue(&task_id, MATERIALIZE_PANICKED.to_string());
                }
                return;
            }
        };
        self.job_tasks.retain(|_, id| id != &task_id);
        self.materializing.remove(&task_id);

        let still_running = self
            .queue
            .get(&task_id)
            .is_some_and(|t| t.status == TaskStatus::Running);

        match result {
            Ok(handle) if still_running => {
                let stored = self.queue.update(&task_id, |task| {
                    task.workspace = Some(handle.clone());
                    task.last_error = None;
                    Ok(())
                });
                match stored {
                    Ok(()) => info!(task_id = %task_id, path = %handle.path.display(), "Workspace materialized"),
                    Err(e) => error!(task_id = %task_id, error = %e, "Failed to record workspace handle"),
                }
            }
            Ok(handle) => {
                debug!(task_id = %task_id, "Task left Running during materialization, tearing down");
                self.spawn_teardown(handle);
            }
            Err(e) if still_running => {
                if e.is_retryable() {
                    warn!(task_id = %task_id, error = %e, "Materialization failed, returning task to queue");
                } else {
                    error!(task_id = %task_id, error = %e, "Materialization failed, returning task to queue");
                }
                self.return_to_queue(&task_id, e.to_string());
            }
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Materialization failed for a task no longer running");
            }
        }
    }

    /// Send a task whose materialization failed back to Ready.
    fn return_to_queue(&mut self, task_id: &str, message: String) {
        self.watchers.stop(task_id);
        if let Err(e) = self.queue.update(task_id, |task| {
            task.transition(TaskStatus::Ready, TransitionCause::MaterializeFailed)?;
            task.last_error = Some(message);
            Ok(())
        }) {
            error!(task_id = %task_id, error = %e, "Failed to revert task");
        }
    }

    fn spawn_teardown(&mut self, handle: WorkspaceHandle) {
        let provisioner = self.provisioner.clone();
        self.background.spawn(async move {
            if let Err(e) = provisioner.tear_down(&handle).await {
                warn!(task_id = %handle.task_id, error = %e, "Workspace teardown failed");
            }
        });
    }

    /// Keep exactly one watcher per Running task.
    fn sync_watchers(&mut self) {
        let running = self.queue.ids_with_status(TaskStatus::Running);
        for id in &running {
            self.watchers.ensure(id, WatchFrom::Beginning);
        }
        self.watchers.retain(&running);
    }

    /// Wait for every in-flight materialization and teardown and apply the
    /// results. Used by `tick --once` and tests.
    pub async fn wait_for_materializations(&mut self) {
        while let Some(joined) = self.jobs.join_next().await {
            self.on_materialized(joined);
        }
        while let Some(joined) = self.background.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Background job panicked");
            }
        }
    }

    /// Stop watchers and wait for spawned work.
    pub async fn shutdown(&mut self) {
        self.wait_for_materializations().await;
        self.cancel.cancel();
        self.watchers.shutdown().await;
    }

    // ========================================================================
    // Views
    // ========================================================================

    pub fn snapshot(&self) -> StatusSnapshot {
        let tasks = self
            .queue
            .all()
            .into_iter()
            .map(|task| {
                let phase = self.marker.read(&task.id);
                let running = task.status == TaskStatus::Running;
                TaskView {
                    id: task.id.clone(),
                    name: task.name.clone(),
                    priority: task.priority,
                    status: task.status,
                    phase,
                    milestone: self.tracker.current(&task.id),
                    startup: running.then(|| self.tracker.recompute_startup_phase(&task.id)),
                    todos: phase
                        .is_active()
                        .then(|| self.marker.todo_progress(&task.id)),
                    last_error: task.last_error.clone(),
                    created_at: task.created_at,
                    started_at: task.started_at,
                    completed_at: task.completed_at,
                }
            })
            .collect();

        StatusSnapshot {
            generated_at: chrono::Utc::now(),
            capacity: self.capacity(),
            running: self.queue.count_running(),
            tasks,
        }
    }

    fn write_snapshot(&self) {
        if let Some(path) = &self.settings.snapshot_path {
            if let Err(e) = self.snapshot().save(path) {
                warn!(path = %path.display(), error = %e, "Failed to write status snapshot");
            }
        }
    }

    pub async fn health_check(&self) -> Vec<HealthIssue> {
        let tasks = self.queue.all();
        run_health_check(
            &tasks,
            &self.marker,
            self.provisioner.as_ref(),
            self.logs.as_ref(),
            &self.settings.health,
        )
        .await
    }
}

/// Provision, mark planning, start the agent. A workspace whose agent
/// never started is torn down before the error is reported.
async fn materialize(
    task_id: String,
    prompt: String,
    provisioner: SharedProvisioner,
    runner: SharedRunner,
    marker: SharedPhaseMarker,
) -> Materialized {
    let result = match provisioner.materialize(&task_id).await {
        Ok(handle) => {
            let started: OrchestratorResult<()> = async {
                marker.write(&task_id, Phase::Planning)?;
                runner.start(&handle, &prompt).await
            }
            .await;
            match started {
                Ok(()) => Ok(handle),
                Err(e) => {
                    if let Err(teardown) = provisioner.tear_down(&handle).await {
                        warn!(task_id = %task_id, error = %teardown, "Teardown after failed start failed");
                    }
                    Err(e)
                }
            }
        }
        Err(e) => Err(e),
    };
    Materialized { task_id, result }
}
