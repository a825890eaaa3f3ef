//! Wiring a [`FleetConfig`] into an engine and its collaborators

use anyhow::{Context, Result};
use coordination::{
    seed_queue, CommandInbox, Engine, EngineDeps, EngineHandle, FileLogSource, FleetConfig,
    HealthIssue, JsonTaskStore, Notifier, PhaseMarker, ProgressTracker, ScriptProvisioner,
    ScriptRunner, SeedFile, StatusSnapshot, SystemProbe, TaskCommand, TaskQueue, TickReport,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Open the persisted queue under the state directory.
pub fn open_queue(config: &FleetConfig) -> Result<TaskQueue> {
    let store = Arc::new(JsonTaskStore::new(config.queue_path()));
    TaskQueue::open(store)
        .with_context(|| format!("failed to open task queue at {}", config.queue_path().display()))
}

/// Engine over the script provisioner and runner described by `config`.
pub fn build_engine(config: &FleetConfig, queue: TaskQueue) -> (Engine, EngineHandle) {
    let layout = config.workspaces.clone();
    let log_dir = config.log_dir();
    let deps = EngineDeps {
        queue,
        tracker: ProgressTracker::new(layout.clone()).shared(),
        marker: PhaseMarker::new(layout.clone()).shared(),
        provisioner: Arc::new(ScriptProvisioner::new(
            config.provisioner.clone(),
            layout.clone(),
            log_dir.clone(),
        )),
        runner: Arc::new(ScriptRunner::new(config.runner.clone(), layout, log_dir.clone())),
        logs: Arc::new(FileLogSource::new(log_dir)),
        probe: Arc::new(SystemProbe::new()),
        notifier: Notifier::from_url(config.notify.webhook_url.as_deref()),
    };
    Engine::new(deps, config.engine_settings())
}

/// Run the control loop until Ctrl-C.
pub async fn run(config: &FleetConfig, seed: Option<&Path>) -> Result<()> {
    let mut queue = open_queue(config)?;
    if let Some(path) = seed {
        let seed = SeedFile::load(path)?;
        seed_queue(&mut queue, seed.tasks)?;
    }

    let (engine, _handle) = build_engine(config, queue);
    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            cancel.cancel();
        }
    });

    info!(
        state_dir = %config.state_dir.display(),
        workspaces = %config.workspaces.root.display(),
        "Fleet starting"
    );
    engine.run().await?;
    Ok(())
}

/// One tick, then wait for every workspace it started.
pub async fn tick_once(config: &FleetConfig) -> Result<TickReport> {
    let (mut engine, _handle) = build_engine(config, open_queue(config)?);
    let report = engine.tick().await?;
    engine.shutdown().await;
    Ok(report)
}

/// Drop commands into the inbox for the running loop to apply.
pub fn submit(config: &FleetConfig, commands: &[TaskCommand]) -> Result<Vec<PathBuf>> {
    let inbox = CommandInbox::new(config.inbox_dir());
    commands
        .iter()
        .map(|command| {
            inbox
                .submit(command)
                .with_context(|| format!("failed to submit {} command", command.name()))
        })
        .collect()
}

/// Last snapshot written by the loop, or one derived from the queue file
/// when the loop has never run.
pub fn status(config: &FleetConfig) -> Result<StatusSnapshot> {
    if let Some(snapshot) = StatusSnapshot::load(&config.snapshot_path())? {
        return Ok(snapshot);
    }
    let (engine, _handle) = build_engine(config, open_queue(config)?);
    Ok(engine.snapshot())
}

pub async fn health(config: &FleetConfig) -> Result<Vec<HealthIssue>> {
    let (engine, _handle) = build_engine(config, open_queue(config)?);
    Ok(engine.health_check().await)
}
