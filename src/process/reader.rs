//! Child stdout read loop.
//!
//! Drives a [`FramedRead`] over the child's stdout with [`LineFramer`],
//! parses every line into a [`Message`] and hands it to a [`ChildListener`].
//! Oversized, non-UTF-8 and malformed lines are logged and skipped; only EOF,
//! an unrecoverable I/O error or cancellation end the loop.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::jsonrpc::codec::{parse_line, Frame, LineFramer};
use crate::jsonrpc::Message;
use crate::AppError;

/// Receiver of everything the child process emits.
///
/// Implementations run on the read loop and must not block: a stalled
/// listener stalls the child's stdout pipe.
pub trait ChildListener: Send + Sync {
    /// A well-formed message was read from the child.
    fn on_message(&self, message: Message);

    /// The child's output ended; every in-flight request is lost.
    fn on_exit(&self, reason: &str);
}

/// Why the read loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The child closed its stdout.
    Eof,
    /// The supervisor is shutting down.
    Cancelled,
    /// Reading failed.
    Failed(String),
}

/// Read and dispatch messages until EOF, failure, or cancellation.
pub async fn run_reader<R>(
    pid: u32,
    stdout: R,
    max_line_bytes: usize,
    listener: &dyn ChildListener,
    cancel: &CancellationToken,
) -> ReadOutcome
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, LineFramer::new(max_line_bytes));

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(pid, "reader: cancellation received, stopping");
                return ReadOutcome::Cancelled;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(pid, "reader: EOF detected");
                        return ReadOutcome::Eof;
                    }
                    Some(Err(err)) => {
                        warn!(pid, %err, "reader: IO error, stopping");
                        return ReadOutcome::Failed(err.to_string());
                    }
                    Some(Ok(Frame::Oversized)) => {
                        let err = AppError::FrameTooLarge(format!(
                            "line exceeded {max_line_bytes} bytes"
                        ));
                        warn!(pid, %err, "reader: discarding oversized line");
                    }
                    Some(Ok(Frame::Invalid)) => {
                        warn!(pid, "reader: discarding line that is not utf-8");
                    }
                    Some(Ok(Frame::Line(line))) => dispatch_line(pid, &line, listener),
                }
            }
        }
    }
}

fn dispatch_line(pid: u32, line: &str, listener: &dyn ChildListener) {
    match parse_line(line) {
        Ok(Some(message)) => {
            trace!(pid, kind = message.kind(), "reader: message from child");
            listener.on_message(message);
        }
        Ok(None) => {}
        Err(err) => {
            warn!(pid, %err, raw_line = %line, "reader: parse error, skipping line");
        }
    }
}
