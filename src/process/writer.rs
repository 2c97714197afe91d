//! Child stdin writer task.
//!
//! One task per child lifetime owns `stdin`. Callers hand it encoded lines
//! through a bounded channel and wait for an acknowledgement, so a caller
//! whose future is dropped mid-write can never leave half a line in the pipe,
//! and a full pipe pushes back on callers rather than on the read loop.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Queued writes per child before callers wait for channel capacity.
pub const WRITE_QUEUE_DEPTH: usize = 64;

/// One encoded line plus the channel its outcome is reported on.
#[derive(Debug)]
pub struct WriteRequest {
    /// Complete `\n`-terminated line.
    pub bytes: Vec<u8>,
    /// Receives the result of the write.
    pub ack: oneshot::Sender<Result<()>>,
}

/// Write queued lines to `stdin` until the queue closes or a write fails.
///
/// Dropping every sender closes the queue; the task then drops `stdin`,
/// which the child observes as EOF.
pub async fn run_writer<W>(pid: u32, stdin: W, mut queue: mpsc::Receiver<WriteRequest>)
where
    W: AsyncWrite + Unpin + Send,
{
    let mut stdin = stdin;

    while let Some(WriteRequest { bytes, ack }) = queue.recv().await {
        let written = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                // The caller may have gone away; the line is written regardless.
                let _ = ack.send(Ok(()));
            }
            Err(err) => {
                warn!(pid, %err, "writer: write to stdin failed, stopping");
                let _ = ack.send(Err(AppError::ProcessUnavailable(format!(
                    "write failed: {err}"
                ))));
                break;
            }
        }
    }

    debug!(pid, "writer: queue closed, releasing stdin");
}
