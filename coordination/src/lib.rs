//! Fleet coordination library
//!
//! Task orchestration for many parallel agent workspaces:
//! - Task queue with priority admission bounded by host capacity
//! - Phase marker reconciliation that survives orchestrator restarts
//! - Progress inference from unstructured provisioning and build output
//!
//! # Components
//!
//! ## Progress inference
//! - `milestone`: ranked milestone catalog and line matcher
//! - `progress`: per-workspace milestone cursor, startup phase from log files
//! - `watcher`: per-workspace log polling tasks feeding the cursor
//!
//! ## Lifecycle
//! - `phase`: agent-written phase marker inside each workspace
//! - `task`, `queue`, `store`: task records, their status lifecycle, persistence
//! - `capacity`: concurrency ceiling from RAM and CPU cores
//! - `engine`: control loop, admission, reconciliation, operator commands
//!
//! ## Boundaries
//! - `workspace`: provisioner, agent runner and log source traits plus
//!   command-template implementations
//! - `health`, `notify`, `config`, `seed`
//!
//! # Usage
//!
//! ```bash
//! # Run the control loop
//! fleet run
//!
//! # Queue a task and watch it
//! fleet add fix-pipes --priority 5 --prompt "Find and fix the leaking pipes"
//! fleet list
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod capacity;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod layout;
pub mod milestone;
pub mod notify;
pub mod phase;
pub mod progress;
pub mod queue;
pub mod seed;
pub mod store;
pub mod task;
pub mod watcher;
pub mod workspace;

// Re-export error types
pub use error::{OrchestratorError, OrchestratorResult};

// Re-export progress inference types
pub use milestone::{match_line, parse_build_step, BuildStep, Milestone, MilestoneTier};
pub use progress::{
    recompute_startup_phase, ProgressTracker, SharedProgressTracker, StartupLogs, StartupPhase,
};
pub use watcher::{WatchFrom, WatcherSet};

// Re-export lifecycle types
pub use capacity::{CapacityPolicy, FixedProbe, HostProbe, HostResources, SystemProbe};
pub use layout::WorkspaceLayout;
pub use phase::{Phase, PhaseMarker, SharedPhaseMarker};
pub use queue::TaskQueue;
pub use store::{JsonTaskStore, MemoryTaskStore, SharedTaskStore, StoreError, TaskStore};
pub use task::{TaskRecord, TaskSpec, TaskStatus, TransitionCause};

// Re-export engine types
pub use engine::{
    CommandInbox, Engine, EngineDeps, EngineHandle, EngineSettings, StatusSnapshot, TaskCommand,
    TaskView, TickReport,
};

// Re-export boundary types
pub use config::FleetConfig;
pub use health::{HealthAction, HealthIssue, HealthSettings, Severity};
pub use notify::Notifier;
pub use seed::{seed_queue, SeedFile};
pub use workspace::{
    AgentRunner, FileLogSource, LogSource, ScriptProvisioner, ScriptRunner, SharedLogSource,
    SharedProvisioner, SharedRunner, WorkspaceHandle, WorkspaceProvisioner,
};
