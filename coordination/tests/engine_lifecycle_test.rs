//! Engine lifecycle integration tests
//!
//! Drives the control loop tick by tick against fake collaborators:
//! - Priority admission bounded by capacity
//! - Phase marker progression to Done and Waiting
//! - Restart with a dead workspace
//! - Provisioning failure, panicking provisioners, failed agent starts
//! - Operator pause, resume, reset, clear-error, remove
//! - Durable inbox and the in-process command channel

use async_trait::async_trait;
use coordination::engine::{MATERIALIZE_PANICKED, WORKSPACE_LOST};
use coordination::{
    AgentRunner, CapacityPolicy, CommandInbox, Engine, EngineDeps, EngineSettings, FileLogSource,
    FixedProbe, JsonTaskStore, Milestone, OrchestratorError, OrchestratorResult, Phase,
    PhaseMarker, ProgressTracker, SharedPhaseMarker, SharedProgressTracker, StatusSnapshot,
    TaskCommand, TaskQueue, TaskSpec, TaskStatus, WorkspaceHandle, WorkspaceLayout,
    WorkspaceProvisioner,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Fake collaborators
// ============================================================================

#[derive(Default)]
struct FakeProvisioner {
    root: PathBuf,
    alive: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    manual: Mutex<HashSet<String>>,
    /// Report every live workspace from `find_running`, as a container
    /// runtime would
    discover_alive: AtomicBool,
    materialized: Mutex<Vec<String>>,
    torn_down: Mutex<Vec<String>>,
}

impl FakeProvisioner {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            ..Default::default()
        }
    }

    fn handle(&self, id: &str) -> WorkspaceHandle {
        WorkspaceHandle::new(id, self.root.join(id))
    }

    fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    fn panic_on(&self, id: &str) {
        self.panicking.lock().unwrap().insert(id.to_string());
    }

    fn heal(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
        self.panicking.lock().unwrap().remove(id);
    }

    fn is_alive_now(&self, id: &str) -> bool {
        self.alive.lock().unwrap().contains(id)
    }

    fn kill(&self, id: &str) {
        self.alive.lock().unwrap().remove(id);
    }

    fn start_manually(&self, id: &str) {
        self.manual.lock().unwrap().insert(id.to_string());
        self.alive.lock().unwrap().insert(id.to_string());
    }

    fn materialized(&self) -> Vec<String> {
        self.materialized.lock().unwrap().clone()
    }

    fn torn_down(&self) -> Vec<String> {
        self.torn_down.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkspaceProvisioner for FakeProvisioner {
    async fn materialize(&self, task_id: &str) -> OrchestratorResult<WorkspaceHandle> {
        if self.panicking.lock().unwrap().contains(task_id) {
            panic!("provisioner crashed while materializing {task_id}");
        }
        if self.failing.lock().unwrap().contains(task_id) {
            return Err(OrchestratorError::provision(
                task_id,
                "devcontainer up exited with status 1",
            ));
        }
        std::fs::create_dir_all(self.root.join(task_id))?;
        self.materialized.lock().unwrap().push(task_id.to_string());
        self.alive.lock().unwrap().insert(task_id.to_string());
        Ok(self.handle(task_id))
    }

    async fn is_alive(&self, handle: &WorkspaceHandle) -> bool {
        self.alive.lock().unwrap().contains(&handle.task_id)
    }

    async fn tear_down(&self, handle: &WorkspaceHandle) -> OrchestratorResult<()> {
        self.alive.lock().unwrap().remove(&handle.task_id);
        self.torn_down.lock().unwrap().push(handle.task_id.clone());
        Ok(())
    }

    async fn find_running(&self, task_id: &str) -> Option<WorkspaceHandle> {
        let discoverable =
            self.discover_alive.load(Ordering::SeqCst) && self.is_alive_now(task_id);
        if discoverable || self.manual.lock().unwrap().contains(task_id) {
            Some(self.handle(task_id))
        } else {
            None
        }
    }
}

#[derive(Default)]
struct FakeRunner {
    started: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeRunner {
    fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    fn heal(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }
}

#[async_trait]
impl AgentRunner for FakeRunner {
    async fn start(&self, handle: &WorkspaceHandle, prompt: &str) -> OrchestratorResult<()> {
        if self.failing.lock().unwrap().contains(&handle.task_id) {
            return Err(OrchestratorError::runner(
                &handle.task_id,
                "agent failed to start",
            ));
        }
        self.started
            .lock()
            .unwrap()
            .push((handle.task_id.clone(), prompt.to_string()));
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    dir: TempDir,
    layout: WorkspaceLayout,
    marker: SharedPhaseMarker,
    tracker: SharedProgressTracker,
    provisioner: Arc<FakeProvisioner>,
    runner: Arc<FakeRunner>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::with_root(dir.path().join("ws"));
        Self {
            marker: PhaseMarker::new(layout.clone()).shared(),
            tracker: ProgressTracker::new(layout.clone()).shared(),
            provisioner: Arc::new(FakeProvisioner::new(layout.root.clone())),
            runner: Arc::new(FakeRunner::default()),
            layout,
            dir,
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    /// A fresh engine over the same persisted queue, as after a restart.
    fn engine(&self, max_concurrent: usize) -> Engine {
        let store = Arc::new(JsonTaskStore::new(self.state_dir().join("queue.json")));
        let queue = TaskQueue::open(store).unwrap();
        let deps = EngineDeps {
            queue,
            tracker: self.tracker.clone(),
            marker: self.marker.clone(),
            provisioner: self.provisioner.clone(),
            runner: self.runner.clone(),
            logs: Arc::new(FileLogSource::new(self.state_dir().join("logs"))),
            probe: Arc::new(FixedProbe::new(64, 32)),
            notifier: None,
        };
        let settings = EngineSettings {
            tick_interval: Duration::from_millis(20),
            log_poll_interval: Duration::from_millis(10),
            capacity: CapacityPolicy {
                max_concurrent: Some(max_concurrent),
                ..Default::default()
            },
            snapshot_path: Some(self.state_dir().join("status.json")),
            inbox_dir: Some(self.state_dir().join("commands")),
            ..Default::default()
        };
        Engine::new(deps, settings).0
    }

    fn set_phase(&self, id: &str, phase: Phase) {
        self.marker.write(id, phase).unwrap();
    }
}

fn status(engine: &Engine, id: &str) -> TaskStatus {
    engine.queue().get(id).unwrap().status
}

async fn enqueue(engine: &mut Engine, id: &str, prompt: &str, priority: i64) {
    engine
        .apply(TaskCommand::Enqueue {
            spec: TaskSpec::new(id, prompt, priority),
        })
        .await
        .unwrap();
}

/// Admit, materialize, and settle into Running with a recorded workspace.
async fn admit_one(engine: &mut Engine, id: &str) {
    let report = engine.tick().await.unwrap();
    assert!(report.admitted.contains(&id.to_string()), "{report:?}");
    engine.wait_for_materializations().await;
    assert!(engine.queue().get(id).unwrap().workspace.is_some());
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_higher_priority_admitted_first() {
    let h = Harness::new();
    let mut engine = h.engine(1);
    enqueue(&mut engine, "later", "second in line", 10).await;
    enqueue(&mut engine, "sooner", "first in line", 5).await;

    let report = engine.tick().await.unwrap();
    assert_eq!(report.capacity, 1);
    assert_eq!(report.admitted, vec!["sooner".to_string()]);
    assert_eq!(status(&engine, "sooner"), TaskStatus::Running);
    assert_eq!(status(&engine, "later"), TaskStatus::Ready);
    assert!(engine.queue().get("sooner").unwrap().started_at.is_some());

    engine.wait_for_materializations().await;
    assert_eq!(h.provisioner.materialized(), vec!["sooner".to_string()]);
    assert_eq!(
        h.runner.started.lock().unwrap().clone(),
        vec![("sooner".to_string(), "first in line".to_string())]
    );
    assert_eq!(h.marker.read("sooner"), Phase::Planning);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_capacity_never_exceeded() {
    let h = Harness::new();
    let mut engine = h.engine(2);
    for i in 0..5 {
        enqueue(&mut engine, &format!("task-{i}"), "work", i).await;
    }

    for round in 0..6 {
        engine.tick().await.unwrap();
        assert!(engine.queue().count_running() <= 2, "round {round}");
        engine.wait_for_materializations().await;

        // Finish whatever is running so new slots open up
        for id in engine.queue().ids_with_status(TaskStatus::Running) {
            h.set_phase(&id, Phase::Done);
        }
    }

    engine.tick().await.unwrap();
    assert_eq!(engine.queue().by_status(TaskStatus::Done).len(), 5);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_empty_prompt_never_admitted() {
    let h = Harness::new();
    let mut engine = h.engine(4);
    enqueue(&mut engine, "blank", "", 1).await;

    for _ in 0..3 {
        let report = engine.tick().await.unwrap();
        assert!(report.admitted.is_empty());
    }
    assert_eq!(status(&engine, "blank"), TaskStatus::NeedsPrompt);
    assert!(h.provisioner.materialized().is_empty());

    engine
        .apply(TaskCommand::SetPrompt {
            id: "blank".to_string(),
            prompt: "now there is work".to_string(),
        })
        .await
        .unwrap();
    admit_one(&mut engine, "blank").await;
    engine.shutdown().await;
}

// ============================================================================
// Phase reconciliation
// ============================================================================

#[tokio::test]
async fn test_phase_progression_to_done() {
    let h = Harness::new();
    let mut engine = h.engine(1);
    enqueue(&mut engine, "fix-pipes", "fix the pipes", 1).await;
    admit_one(&mut engine, "fix-pipes").await;

    for phase in [Phase::Planning, Phase::Ready, Phase::Executing] {
        h.set_phase("fix-pipes", phase);
        engine.tick().await.unwrap();
        assert_eq!(status(&engine, "fix-pipes"), TaskStatus::Running, "{phase:?}");
        assert!(engine.queue().get("fix-pipes").unwrap().completed_at.is_none());
    }

    h.set_phase("fix-pipes", Phase::Done);
    let report = engine.tick().await.unwrap();
    assert_eq!(report.completed, vec!["fix-pipes".to_string()]);
    let task = engine.queue().get("fix-pipes").unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task.completed_at.is_some());

    // Done workspaces are cleaned up in the background
    engine.wait_for_materializations().await;
    assert_eq!(h.provisioner.torn_down(), vec!["fix-pipes".to_string()]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_suspending_phases_park_task_in_waiting() {
    let h = Harness::new();
    let mut engine = h.engine(4);
    let cases = [
        ("auth", Phase::AuthError, Some("agent authentication failed")),
        ("err", Phase::Error, Some("agent reported an error")),
        ("iter", Phase::MaxIterations, Some("agent reached its iteration limit")),
        ("ask", Phase::AwaitingAnswers, Some("agent is awaiting answers")),
        ("review", Phase::ReadyForReview, None),
    ];
    for (id, _, _) in &cases {
        enqueue(&mut engine, id, "work", 1).await;
    }
    engine.tick().await.unwrap();
    engine.wait_for_materializations().await;
    engine.tick().await.unwrap();
    engine.wait_for_materializations().await;

    for (id, phase, _) in &cases {
        h.set_phase(id, *phase);
    }
    let report = engine.tick().await.unwrap();
    assert_eq!(report.waiting.len(), 4);

    // The fifth task gets the slot freed by the others
    engine.wait_for_materializations().await;
    h.set_phase("review", Phase::ReadyForReview);
    engine.tick().await.unwrap();

    for (id, _, message) in &cases {
        let task = engine.queue().get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Waiting, "{id}");
        assert_eq!(task.last_error.as_deref(), *message, "{id}");
    }

    // Waiting is never auto-retried
    engine.tick().await.unwrap();
    assert_eq!(engine.queue().by_status(TaskStatus::Waiting).len(), 5);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_restart_with_dead_workspace_marks_lost() {
    let h = Harness::new();
    {
        let mut engine = h.engine(1);
        enqueue(&mut engine, "fix-pipes", "fix the pipes", 1).await;
        admit_one(&mut engine, "fix-pipes").await;
        h.set_phase("fix-pipes", Phase::Executing);
        engine.shutdown().await;
    }

    // Orchestrator is down while the workspace dies
    h.provisioner.kill("fix-pipes");

    let mut engine = h.engine(1);
    assert_eq!(status(&engine, "fix-pipes"), TaskStatus::Running);
    let report = engine.tick().await.unwrap();
    assert_eq!(report.lost, vec!["fix-pipes".to_string()]);
    assert!(report.admitted.is_empty());

    let task = engine.queue().get("fix-pipes").unwrap();
    assert_eq!(task.status, TaskStatus::Waiting);
    assert_eq!(task.last_error.as_deref(), Some(WORKSPACE_LOST));

    engine.tick().await.unwrap();
    assert_eq!(status(&engine, "fix-pipes"), TaskStatus::Waiting);
    assert_eq!(h.provisioner.materialized().len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_restart_with_live_workspace_keeps_running() {
    let h = Harness::new();
    {
        let mut engine = h.engine(1);
        enqueue(&mut engine, "fix-pipes", "fix the pipes", 1).await;
        admit_one(&mut engine, "fix-pipes").await;
        h.set_phase("fix-pipes", Phase::Executing);
        engine.shutdown().await;
    }

    let mut engine = h.engine(1);
    let report = engine.tick().await.unwrap();
    assert!(report.lost.is_empty());
    assert_eq!(status(&engine, "fix-pipes"), TaskStatus::Running);

    // Done written while the orchestrator was down is picked up on the next tick
    h.set_phase("fix-pipes", Phase::Done);
    engine.tick().await.unwrap();
    assert_eq!(status(&engine, "fix-pipes"), TaskStatus::Done);
    engine.shutdown().await;
}

// ============================================================================
// Failures and operator commands
// ============================================================================

#[tokio::test]
async fn test_provisioning_failure_returns_task_to_ready() {
    let h = Harness::new();
    let mut engine = h.engine(1);
    h.provisioner.fail("fix-pipes");
    enqueue(&mut engine, "fix-pipes", "fix the pipes", 1).await;

    engine.tick().await.unwrap();
    engine.wait_for_materializations().await;
    let task = engine.queue().get("fix-pipes").unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert!(task
        .last_error
        .as_deref()
        .unwrap()
        .contains("devcontainer up exited with status 1"));

    h.provisioner.heal("fix-pipes");
    admit_one(&mut engine, "fix-pipes").await;
    let task = engine.queue().get("fix-pipes").unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.last_error.is_none());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_panicked_materialization_frees_slot() {
    let h = Harness::new();
    let mut engine = h.engine(1);
    h.provisioner.panic_on("a");
    enqueue(&mut engine, "a", "first", 1).await;
    enqueue(&mut engine, "b", "second", 2).await;

    engine.tick().await.unwrap();
    engine.wait_for_materializations().await;
    assert!(!engine.is_materializing("a"));
    let task = engine.queue().get("a").unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(task.last_error.as_deref(), Some(MATERIALIZE_PANICKED));
    assert_eq!(engine.queue().count_running(), 0);

    // The slot is free again: once the provisioner recovers, both run in turn
    h.provisioner.heal("a");
    admit_one(&mut engine, "a").await;
    assert!(engine.queue().get("a").unwrap().last_error.is_none());
    h.set_phase("a", Phase::Done);
    let report = engine.tick().await.unwrap();
    assert_eq!(report.completed, vec!["a".to_string()]);
    assert_eq!(report.admitted, vec!["b".to_string()]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_failed_agent_start_tears_down_workspace() {
    let h = Harness::new();
    let mut engine = h.engine(1);
    h.provisioner.discover_alive.store(true, Ordering::SeqCst);
    h.runner.fail("a");
    enqueue(&mut engine, "a", "fix the pipes", 1).await;

    engine.tick().await.unwrap();
    engine.wait_for_materializations().await;
    let task = engine.queue().get("a").unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert!(task
        .last_error
        .as_deref()
        .unwrap()
        .contains("agent failed to start"));
    assert!(task.workspace.is_none());
    assert!(!h.provisioner.is_alive_now("a"));
    assert_eq!(h.provisioner.torn_down(), vec!["a".to_string()]);

    // Nothing left to adopt; the task is admitted afresh
    h.runner.heal("a");
    let report = engine.tick().await.unwrap();
    assert!(report.adopted.is_empty());
    assert_eq!(report.admitted, vec!["a".to_string()]);
    engine.wait_for_materializations().await;
    let task = engine.queue().get("a").unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.last_error.is_none());
    assert_eq!(h.runner.started.lock().unwrap().len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_pause_and_resume_reset_progress() {
    let h = Harness::new();
    let mut engine = h.engine(1);
    enqueue(&mut engine, "fix-pipes", "fix the pipes", 1).await;
    admit_one(&mut engine, "fix-pipes").await;
    h.tracker.observe("fix-pipes", "Build succeeded.");
    h.set_phase("fix-pipes", Phase::Executing);

    engine
        .apply(TaskCommand::Pause {
            id: "fix-pipes".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(status(&engine, "fix-pipes"), TaskStatus::Paused);
    assert!(engine.queue().get("fix-pipes").unwrap().workspace.is_none());
    engine.wait_for_materializations().await;
    assert_eq!(h.provisioner.torn_down(), vec!["fix-pipes".to_string()]);

    // Paused tasks are neither reconciled nor admitted
    engine.tick().await.unwrap();
    assert_eq!(status(&engine, "fix-pipes"), TaskStatus::Paused);

    engine
        .apply(TaskCommand::Resume {
            id: "fix-pipes".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(status(&engine, "fix-pipes"), TaskStatus::Ready);
    assert_eq!(h.tracker.current("fix-pipes"), None);
    assert_eq!(h.marker.read("fix-pipes"), Phase::None);

    admit_one(&mut engine, "fix-pipes").await;
    assert_eq!(h.provisioner.materialized().len(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_reset_retries_waiting_task_and_clear_error_keeps_status() {
    let h = Harness::new();
    let mut engine = h.engine(1);
    enqueue(&mut engine, "fix-pipes", "fix the pipes", 1).await;
    admit_one(&mut engine, "fix-pipes").await;
    h.set_phase("fix-pipes", Phase::MaxIterations);
    engine.tick().await.unwrap();
    assert_eq!(status(&engine, "fix-pipes"), TaskStatus::Waiting);

    engine
        .apply(TaskCommand::ClearError {
            id: "fix-pipes".to_string(),
        })
        .await
        .unwrap();
    let task = engine.queue().get("fix-pipes").unwrap();
    assert_eq!(task.status, TaskStatus::Waiting);
    assert!(task.last_error.is_none());
    assert_eq!(h.marker.read("fix-pipes"), Phase::MaxIterations);

    engine
        .apply(TaskCommand::Reset {
            id: "fix-pipes".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(status(&engine, "fix-pipes"), TaskStatus::Ready);
    assert_eq!(h.marker.read("fix-pipes"), Phase::None);

    admit_one(&mut engine, "fix-pipes").await;
    engine.shutdown().await;
}

#[tokio::test]
async fn test_invalid_commands_are_rejected() {
    let h = Harness::new();
    let mut engine = h.engine(1);
    enqueue(&mut engine, "fix-pipes", "fix the pipes", 1).await;

    let err = engine
        .apply(TaskCommand::Resume {
            id: "fix-pipes".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));

    let err = engine
        .apply(TaskCommand::Pause {
            id: "missing".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::TaskNotFound { .. }));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_remove_tears_down_workspace() {
    let h = Harness::new();
    let mut engine = h.engine(1);
    enqueue(&mut engine, "fix-pipes", "fix the pipes", 1).await;
    admit_one(&mut engine, "fix-pipes").await;

    engine
        .apply(TaskCommand::Remove {
            id: "fix-pipes".to_string(),
        })
        .await
        .unwrap();
    assert!(engine.queue().get("fix-pipes").is_none());
    engine.wait_for_materializations().await;
    assert_eq!(h.provisioner.torn_down(), vec!["fix-pipes".to_string()]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_manually_started_workspace_is_adopted() {
    let h = Harness::new();
    let mut engine = h.engine(2);
    enqueue(&mut engine, "manual", "already running", 5).await;
    h.provisioner.start_manually("manual");

    let report = engine.tick().await.unwrap();
    assert_eq!(report.adopted, vec!["manual".to_string()]);
    assert!(report.admitted.is_empty());
    assert_eq!(status(&engine, "manual"), TaskStatus::Running);
    assert!(h.provisioner.materialized().is_empty());
    engine.shutdown().await;
}

// ============================================================================
// Command surfaces and views
// ============================================================================

#[tokio::test]
async fn test_inbox_commands_applied_on_tick() {
    let h = Harness::new();
    let mut engine = h.engine(1);
    let inbox = CommandInbox::new(h.state_dir().join("commands"));
    inbox
        .submit(&TaskCommand::Enqueue {
            spec: TaskSpec::new("from-cli", "queued from another process", 3),
        })
        .unwrap();
    // A failing command does not block the rest
    inbox
        .submit(&TaskCommand::Pause {
            id: "missing".to_string(),
        })
        .unwrap();

    let report = engine.tick().await.unwrap();
    assert_eq!(report.commands, 2);
    assert_eq!(report.admitted, vec!["from-cli".to_string()]);
    assert!(inbox.drain().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_written_each_tick() {
    let h = Harness::new();
    let mut engine = h.engine(1);
    enqueue(&mut engine, "fix-pipes", "fix the pipes", 1).await;
    admit_one(&mut engine, "fix-pipes").await;

    let logs = h.state_dir().join("logs");
    std::fs::create_dir_all(&logs).unwrap();
    std::fs::write(logs.join("fix-pipes.log"), "Restoring\n").unwrap();
    let todos = h.layout.todos_path("fix-pipes");
    std::fs::write(&todos, "- [x] plan\n- [ ] build\n").unwrap();
    h.set_phase("fix-pipes", Phase::Executing);

    let mut milestone = None;
    for _ in 0..100 {
        milestone = h.tracker.current("fix-pipes");
        if milestone.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(milestone, Some(Milestone::RestoringPackages));

    engine.tick().await.unwrap();
    let snapshot = StatusSnapshot::load(&h.state_dir().join("status.json"))
        .unwrap()
        .unwrap();
    let view = snapshot.task("fix-pipes").unwrap();
    assert_eq!(view.status, TaskStatus::Running);
    assert_eq!(view.phase, Phase::Executing);
    assert_eq!(view.milestone, Some(Milestone::RestoringPackages));
    assert_eq!(view.todos, Some((1, 2)));
    assert_eq!(snapshot.running, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_run_loop_with_handle() {
    let h = Harness::new();
    let store = Arc::new(JsonTaskStore::new(h.state_dir().join("queue.json")));
    let deps = EngineDeps {
        queue: TaskQueue::open(store).unwrap(),
        tracker: h.tracker.clone(),
        marker: h.marker.clone(),
        provisioner: h.provisioner.clone(),
        runner: h.runner.clone(),
        logs: Arc::new(FileLogSource::new(h.state_dir().join("logs"))),
        probe: Arc::new(FixedProbe::new(64, 32)),
        notifier: None,
    };
    let settings = EngineSettings {
        tick_interval: Duration::from_millis(20),
        log_poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let (engine, handle) = Engine::new(deps, settings);
    let task = tokio::spawn(engine.run());

    handle
        .enqueue(TaskSpec::new("fix-pipes", "fix the pipes", 1))
        .await
        .unwrap();

    let mut running = false;
    for _ in 0..100 {
        let snapshot = handle.snapshot().await.unwrap();
        if snapshot
            .task("fix-pipes")
            .is_some_and(|t| t.status == TaskStatus::Running)
        {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(running);

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
    assert!(matches!(
        handle.reconcile().await,
        Err(OrchestratorError::EngineStopped)
    ));
}
