//! Per-workspace log files read incrementally from a byte offset

use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Complete lines read since the previous offset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogChunk {
    pub lines: Vec<String>,
    /// Offset to pass to the next read
    pub next_offset: u64,
}

/// Re-readable, line-oriented output of one workspace
pub trait LogSource: Send + Sync {
    /// Complete lines starting at `offset`. A trailing partial line is left
    /// for the next call. A log shorter than `offset` was rotated or
    /// truncated and is read again from the start.
    fn read_from(&self, workspace_id: &str, offset: u64) -> std::io::Result<LogChunk>;

    /// Current end of the log; where a watcher for a fresh attempt starts.
    fn end_offset(&self, workspace_id: &str) -> std::io::Result<u64>;
}

pub type SharedLogSource = Arc<dyn LogSource>;

/// One `<dir>/<workspace_id>.log` file per workspace
#[derive(Debug, Clone)]
pub struct FileLogSource {
    dir: PathBuf,
}

impl FileLogSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, workspace_id: &str) -> PathBuf {
        log_path(&self.dir, workspace_id)
    }
}

pub(crate) fn log_path(dir: &Path, workspace_id: &str) -> PathBuf {
    dir.join(format!("{workspace_id}.log"))
}

impl LogSource for FileLogSource {
    fn read_from(&self, workspace_id: &str, offset: u64) -> std::io::Result<LogChunk> {
        let mut file = match std::fs::File::open(self.path(workspace_id)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(LogChunk {
                    lines: Vec::new(),
                    next_offset: 0,
                })
            }
            Err(e) => return Err(e),
        };

        let len = file.metadata()?.len();
        let start = if len < offset { 0 } else { offset };
        file.seek(SeekFrom::Start(start))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let complete = match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        let lines = String::from_utf8_lossy(&buf[..complete])
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .collect();

        Ok(LogChunk {
            lines,
            next_offset: start + complete as u64,
        })
    }

    fn end_offset(&self, workspace_id: &str) -> std::io::Result<u64> {
        match std::fs::metadata(self.path(workspace_id)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }
}
