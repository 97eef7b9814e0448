//! Child output capture: a bounded ring of lines drained from stdout/stderr
//!
//! A piped child that writes more than the pipe buffer blocks until someone
//! reads. The drain tasks keep reading for the whole run and retain only the
//! most recent lines.

use chrono::{SecondsFormat, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Which child stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// A single line captured from the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Monotonic sequence number, assigned on push
    pub seq: u64,
    /// Stream the line was read from
    pub stream: OutputStream,
    /// Line content without the trailing newline
    pub content: String,
    /// Capture time in RFC3339 format
    pub timestamp: String,
}

impl OutputLine {
    /// Build a line stamped with the current time; `seq` is set by the ring
    pub fn new(stream: OutputStream, content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            stream,
            content: content.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Bounded ring of captured lines.
///
/// - When capacity is exceeded, the oldest line is dropped and `total_dropped` grows.
/// - Sequence numbers increase monotonically across evictions.
#[derive(Debug)]
pub struct OutputRing {
    capacity: usize,
    total_dropped: u64,
    next_seq: u64,
    lines: VecDeque<OutputLine>,
}

impl OutputRing {
    /// Create a ring holding at most `capacity` lines; a zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            total_dropped: 0,
            next_seq: 0,
            lines: VecDeque::with_capacity(capacity),
        }
    }

    /// Push a line, evicting the oldest one when full
    pub fn push(&mut self, mut line: OutputLine) {
        line.seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.total_dropped = self.total_dropped.saturating_add(1);
        }
        self.lines.push_back(line);
    }

    /// Number of lines retained
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether nothing has been retained
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines evicted because of capacity
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }

    /// Copy of the retained lines, oldest first
    pub fn snapshot(&self) -> Vec<OutputLine> {
        self.lines.iter().cloned().collect()
    }
}

/// Shared handle to the ring filled by the drain tasks
pub type SharedOutput = Arc<Mutex<OutputRing>>;

/// Captured output of one child: the ring plus the tasks feeding it
#[derive(Debug)]
pub struct OutputCapture {
    ring: SharedOutput,
    drains: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    /// Create an empty capture with the given line capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Arc::new(Mutex::new(OutputRing::new(capacity))),
            drains: Vec::new(),
        }
    }

    /// Start draining `reader` line by line into the ring
    pub fn attach<R>(&mut self, stream: OutputStream, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let ring = Arc::clone(&self.ring);
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(content)) => {
                        trace!(?stream, %content, "captured child output");
                        ring.lock().await.push(OutputLine::new(stream, content));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(?stream, "stopped draining child output: {}", e);
                        break;
                    }
                }
            }
        });
        self.drains.push(handle);
    }

    /// Wait for the drains to reach end-of-stream and return the retained lines.
    ///
    /// Drains end once every writer of the pipe is gone, which normally
    /// happens when the process group is reaped. Drains still running after
    /// `grace` are aborted.
    pub async fn finish(self, grace: std::time::Duration) -> (Vec<OutputLine>, u64) {
        for mut drain in self.drains {
            if tokio::time::timeout(grace, &mut drain).await.is_err() {
                debug!("output drain still open after {:?}, aborting", grace);
                drain.abort();
            }
        }
        let ring = self.ring.lock().await;
        (ring.snapshot(), ring.total_dropped())
    }
}
