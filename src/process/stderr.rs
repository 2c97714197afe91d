//! Bounded capture of the child's standard error.
//!
//! Stderr is diagnostics only. Lines are echoed at `DEBUG` and the most
//! recent ones are kept so crash reports can include them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::debug;

use crate::jsonrpc::codec::{Frame, LineFramer};

/// Longest stderr line retained verbatim.
const MAX_STDERR_LINE_BYTES: usize = 16 * 1024;

/// Ring buffer of the most recent stderr lines.
#[derive(Debug)]
pub struct StderrRing {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl StderrRing {
    /// Create a ring holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The last `n` lines, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Every retained line, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.tail(self.capacity)
    }
}

/// Drain `stderr` into `ring` until EOF.
#[must_use]
pub fn spawn_stderr_drain<R>(pid: u32, stderr: R, ring: Arc<StderrRing>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut framed = FramedRead::new(stderr, LineFramer::new(MAX_STDERR_LINE_BYTES));
        while let Some(frame) = framed.next().await {
            match frame {
                Ok(Frame::Line(line)) => {
                    debug!(pid, line = %line, "child stderr");
                    ring.push(line);
                }
                Ok(Frame::Oversized) => ring.push("[stderr line truncated]".into()),
                Ok(Frame::Invalid) => ring.push("[stderr line not utf-8]".into()),
                Err(err) => {
                    debug!(pid, %err, "child stderr read failed");
                    break;
                }
            }
        }
        debug!(pid, "child stderr closed");
    })
}
