//! Progress inference from unstructured workspace output
//!
//! Two views of the same workspace:
//! - a streaming milestone cursor fed line by line by log watchers
//! - a coarse startup phase re-derived from log files on demand
//!
//! Neither is persisted. Both can be rebuilt after an orchestrator restart by
//! rescanning output, so losing them only causes a harmless re-announcement.

pub mod startup;
pub mod tracker;

pub use startup::{classify, recompute_startup_phase, StartupLogs, StartupPhase};
pub use tracker::{ProgressTracker, SharedProgressTracker};
