//! Whole-file log observation with change-only deltas
//!
//! The application under test may rewrite its log wholesale on every update,
//! so the file is always read as one opaque blob and compared to the last
//! observed content. A missing file reads as empty content.

use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default delay between two polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// New log content observed on a poll tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// Full content of the file at observation time
    pub content: String,
    /// When the change was observed
    pub observed_at: DateTime<Utc>,
}

/// Last observed state of the log file
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    path: PathBuf,
    last_content: String,
    last_read: Option<DateTime<Utc>>,
}

impl LogSnapshot {
    /// Empty snapshot for `path`; nothing has been read yet
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_content: String::new(),
            last_read: None,
        }
    }

    /// Observed file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content seen on the last successful read
    pub fn last_content(&self) -> &str {
        &self.last_content
    }

    /// Time of the last successful read
    pub fn last_read(&self) -> Option<DateTime<Utc>> {
        self.last_read
    }

    /// Record freshly read content and report it if it differs from the last one.
    ///
    /// Surrounding whitespace is ignored, so a trailing newline added by a
    /// rewrite does not count as a change.
    pub fn observe(&mut self, raw: &str, at: DateTime<Utc>) -> Option<Delta> {
        self.last_read = Some(at);
        let content = raw.trim();
        if content == self.last_content {
            return None;
        }
        self.last_content = content.to_string();
        Some(Delta {
            content: self.last_content.clone(),
            observed_at: at,
        })
    }
}

/// Polls one log file and turns content changes into [`Delta`]s
#[derive(Debug)]
pub struct LogTailWatcher {
    snapshot: LogSnapshot,
    interval: Duration,
}

impl LogTailWatcher {
    /// Watch `path` at the default cadence
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_interval(path, DEFAULT_POLL_INTERVAL)
    }

    /// Watch `path`, polling every `interval`
    pub fn with_interval(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            snapshot: LogSnapshot::new(path),
            interval,
        }
    }

    /// Delay the run loop should wait between polls
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Current snapshot
    pub fn snapshot(&self) -> &LogSnapshot {
        &self.snapshot
    }

    /// Read the file once and report a delta if its content changed.
    ///
    /// An unreadable file yields `LogReadError` and leaves the snapshot
    /// untouched; callers treat it as "no change this tick".
    pub async fn poll(&mut self) -> Result<Option<Delta>> {
        let raw = read_log(self.snapshot.path()).await?;
        let delta = self.snapshot.observe(&raw, Utc::now());
        if let Some(d) = &delta {
            debug!(path = ?self.snapshot.path(), bytes = d.content.len(), "log content changed");
        }
        Ok(delta)
    }
}

/// Read the whole log, treating a missing file as empty
async fn read_log(path: &Path) -> Result<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(CoreError::LogReadError {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
