//! Fleet configuration
//!
//! Defaults, then an optional TOML file, then `FLEET_*` environment
//! variables. Every section is `#[serde(default)]` so a config file only
//! needs the keys it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::capacity::CapacityPolicy;
use crate::engine::EngineSettings;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::health::HealthSettings;
use crate::layout::WorkspaceLayout;
use crate::workspace::{ProvisionerCommands, RunnerCommand};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "FLEET_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    pub log_poll_ms: u64,
    pub adopt_manual_starts: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 10,
            log_poll_ms: 1000,
            adopt_manual_starts: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Queue file, command inbox, logs and status snapshot live here
    pub state_dir: PathBuf,
    pub workspaces: WorkspaceLayout,
    pub scheduler: SchedulerConfig,
    pub capacity: CapacityPolicy,
    pub health: HealthSettings,
    pub provisioner: ProvisionerCommands,
    pub runner: RunnerCommand,
    pub notify: NotifyConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        let state_dir = std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".config").join("fleet"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/fleet"));
        Self {
            state_dir,
            workspaces: WorkspaceLayout::default(),
            scheduler: SchedulerConfig::default(),
            capacity: CapacityPolicy::default(),
            health: HealthSettings::default(),
            provisioner: ProvisionerCommands::default(),
            runner: RunnerCommand::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Load from `path`, else from `$FLEET_CONFIG`, else defaults; then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> OrchestratorResult<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> OrchestratorResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| OrchestratorError::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml(&content).map_err(|e| OrchestratorError::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `FLEET_*` overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> OrchestratorResult<()> {
        if let Some(dir) = lookup("FLEET_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(root) = lookup("FLEET_WORKSPACES_ROOT") {
            self.workspaces.root = PathBuf::from(root);
        }
        if let Some(secs) = lookup("FLEET_TICK_SECS") {
            self.scheduler.tick_secs = parse_env("FLEET_TICK_SECS", &secs)?;
        }
        if let Some(max) = lookup("FLEET_MAX_CONCURRENT") {
            self.capacity.max_concurrent = Some(parse_env("FLEET_MAX_CONCURRENT", &max)?);
        }
        if let Some(url) = lookup("FLEET_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
        if let Some(cmd) = lookup("FLEET_MATERIALIZE_CMD") {
            self.provisioner.materialize = cmd;
        }
        if let Some(cmd) = lookup("FLEET_RUNNER_CMD") {
            self.runner.start = cmd;
        }
        Ok(())
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.scheduler.tick_secs == 0 {
            return Err(OrchestratorError::config("scheduler.tick_secs must be at least 1"));
        }
        if self.capacity.ram_per_instance_gb == 0 || self.capacity.cores_per_instance == 0 {
            return Err(OrchestratorError::config(
                "capacity per-instance figures must be non-zero",
            ));
        }
        if self.provisioner.materialize.trim().is_empty() {
            return Err(OrchestratorError::config("provisioner.materialize is empty"));
        }
        if self.runner.start.trim().is_empty() {
            return Err(OrchestratorError::config("runner.start is empty"));
        }
        Ok(())
    }

    pub fn queue_path(&self) -> PathBuf {
        self.state_dir.join("queue.json")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.state_dir.join("commands")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join("status.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            tick_interval: Duration::from_secs(self.scheduler.tick_secs),
            log_poll_interval: Duration::from_millis(self.scheduler.log_poll_ms.max(10)),
            capacity: self.capacity.clone(),
            health: self.health.clone(),
            adopt_manual_starts: self.scheduler.adopt_manual_starts,
            snapshot_path: Some(self.snapshot_path()),
            inbox_dir: Some(self.inbox_dir()),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> OrchestratorResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| OrchestratorError::config(format!("{key}={value:?} is not a valid number")))
}
