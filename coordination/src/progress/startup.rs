//! Coarse startup phase derived from workspace log files
//!
//! Unlike the streaming milestone cursor, this reads the *current* content of
//! two well-known logs and re-derives the phase from scratch every call. The
//! checks run from most complete to least complete and only test for
//! substrings, so appending output can never move the answer backwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Startup milestone of a workspace, in increasing order of completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPhase {
    NotStarted,
    Container,
    Parsers,
    Compiling,
    ServerRunning,
    LoadingPackages,
    Ready,
}

impl StartupPhase {
    pub fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "starting",
            Self::Container => "starting container",
            Self::Parsers => "building parsers",
            Self::Compiling => "compiling",
            Self::ServerRunning => "server running",
            Self::LoadingPackages => "loading packages",
            Self::Ready => "ready",
        }
    }

    /// Progress indicator such as "[3/6]"
    pub fn progress(self) -> String {
        format!("[{}/6]", self as u8)
    }
}

impl fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// The pair of log files the startup phase is derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupLogs {
    pub build_log: PathBuf,
    pub server_log: PathBuf,
}

impl StartupLogs {
    pub fn new(build_log: impl Into<PathBuf>, server_log: impl Into<PathBuf>) -> Self {
        Self {
            build_log: build_log.into(),
            server_log: server_log.into(),
        }
    }
}

/// Read a log, treating absence and read failures as empty content.
fn read_log(path: &Path) -> String {
    // Container output is not guaranteed to be UTF-8
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read startup log");
            String::new()
        }
    }
}

/// Derive the startup phase from the current content of both logs.
pub fn recompute_startup_phase(logs: &StartupLogs) -> StartupPhase {
    let build = read_log(&logs.build_log);
    let server = read_log(&logs.server_log);
    classify(&build, &server)
}

/// Pure classification over log contents, most complete marker first.
pub fn classify(build: &str, server: &str) -> StartupPhase {
    let listening = server.contains("Now listening on:");

    if build.contains("-- Initial compile succeeded --")
        || build.contains("Done reloading packages")
    {
        return StartupPhase::Ready;
    }
    if listening && build.contains("reload-packages") {
        return StartupPhase::LoadingPackages;
    }
    if listening || build.contains("Build succeeded.") {
        return StartupPhase::ServerRunning;
    }
    if build.contains("dotnet build")
        || build.contains("Restoring")
        || (build.contains("tree-sitter") && build.contains(">> Success"))
    {
        return StartupPhase::Compiling;
    }
    if build.contains("tree-sitter") {
        return StartupPhase::Parsers;
    }
    if !build.trim().is_empty() || !server.trim().is_empty() {
        return StartupPhase::Container;
    }
    StartupPhase::NotStarted
}
