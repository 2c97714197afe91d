//! Process supervisor.
//!
//! Owns the single child process and the only handles to its pipes. All
//! writes go through [`ProcessSupervisor::write`], which queues the framed
//! line for the per-child writer task so each line reaches stdin intact. A
//! supervision task runs the read loop for each child lifetime and, when the
//! child's output ends, reports the crash to the [`ChildListener`] and
//! relaunches with exponential backoff until the retry budget is spent.
//!
//! [`ProcessSupervisor::stop`] is the one shutdown path: it closes stdin,
//! signals the child, waits out the grace period, and force-kills.

use std::fmt::{Display, Formatter};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::{Child, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{ProcessConfig, RestartConfig};
use crate::jsonrpc::codec::encode_line;
use crate::jsonrpc::Message;
use crate::process::reader::{run_reader, ChildListener, ReadOutcome};
use crate::process::spawner::spawn_child;
use crate::process::stderr::{spawn_stderr_drain, StderrRing};
use crate::process::writer::{run_writer, WriteRequest, WRITE_QUEUE_DEPTH};
use crate::{AppError, Result};

/// Number of stderr lines attached to crash reports.
const CRASH_STDERR_LINES: usize = 20;

/// Lifecycle state of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// A launch is in progress.
    Starting,
    /// The child is accepting writes.
    Running,
    /// The child's output ended; a restart may follow.
    Crashed,
    /// Not running and not going to be restarted.
    Stopped,
}

impl Display for ProcessState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Supervisor of one child process.
pub struct ProcessSupervisor {
    config: ProcessConfig,
    restart: RestartConfig,
    state: watch::Sender<ProcessState>,
    writer: Mutex<Option<mpsc::Sender<WriteRequest>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: AtomicU32,
    restarts: AtomicU32,
    stderr: Arc<StderrRing>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("command", &self.config.command)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Create a supervisor; nothing is spawned until [`start`](Self::start).
    #[must_use]
    pub fn new(config: ProcessConfig, restart: RestartConfig) -> Self {
        let stderr = Arc::new(StderrRing::new(config.stderr_lines));
        let (state, _) = watch::channel(ProcessState::Stopped);
        Self {
            config,
            restart,
            state,
            writer: Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            pid: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
            stderr,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Launch the child and begin supervising it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessUnavailable` if the initial launch fails or
    /// the supervisor was already started or stopped.
    pub async fn start(self: &Arc<Self>, listener: Arc<dyn ChildListener>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::ProcessUnavailable("supervisor already stopped".into()));
        }
        if self.state() != ProcessState::Stopped || self.has_task() {
            return Err(AppError::ProcessUnavailable("supervisor already started".into()));
        }

        let stdout = match self.launch().await {
            Ok(stdout) => stdout,
            Err(err) => {
                self.set_state(ProcessState::Stopped);
                return Err(err);
            }
        };

        let span = info_span!("supervise", command = %self.config.command);
        let handle = tokio::spawn(Arc::clone(self).supervise(stdout, listener).instrument(span));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Write one framed message to the child's stdin.
    ///
    /// Lines are written in the order their callers reach the queue. A full
    /// pipe makes callers wait for queue capacity; the read loop never waits.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessUnavailable` if the child is not `Running`
    /// or the write fails.
    pub async fn write(&self, message: &Message) -> Result<()> {
        let bytes = encode_line(message)?;

        let state = self.state();
        if state != ProcessState::Running {
            return Err(AppError::ProcessUnavailable(format!("child process is {state}")));
        }

        let queue = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| AppError::ProcessUnavailable("child stdin is closed".into()))?;

        let (ack, done) = oneshot::channel();
        queue
            .send(WriteRequest { bytes, ack })
            .await
            .map_err(|_| AppError::ProcessUnavailable("child stdin is closed".into()))?;

        done.await
            .map_err(|_| AppError::ProcessUnavailable("child stdin closed before write".into()))?
    }

    /// Stop supervising and terminate the child.
    ///
    /// Idempotent; later calls return once the first has finished.
    pub async fn stop(&self) {
        let span = info_span!("stop_child", pid = self.pid());
        async {
            self.cancel.cancel();

            // Closing stdin is the polite shutdown request for stdio servers.
            self.close_stdin();

            let child = self.child.lock().await.take();
            if let Some(mut child) = child {
                let status = terminate_child(&mut child, self.config.stop_grace()).await;
                info!(status = %describe_exit(status), "child process stopped");
            }

            let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(task) = task {
                if let Err(err) = task.await {
                    warn!(%err, "supervision task ended abnormally");
                }
            }

            self.pid.store(0, Ordering::SeqCst);
            self.set_state(ProcessState::Stopped);
        }
        .instrument(span)
        .await;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// OS process id of the current child, or 0 when none is running.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    /// Number of successful restarts since start.
    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Recent stderr lines of the child, oldest first.
    #[must_use]
    pub fn recent_stderr(&self) -> Vec<String> {
        self.stderr.snapshot()
    }

    fn has_task(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn close_stdin(&self) {
        drop(self.writer.lock().unwrap_or_else(PoisonError::into_inner).take());
    }

    fn set_state(&self, state: ProcessState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "process state changed");
        }
    }

    /// Spawn a child, install its pipes, and mark it `Running`.
    async fn launch(&self) -> Result<ChildStdout> {
        self.set_state(ProcessState::Starting);
        let conn = spawn_child(&self.config)?;

        // Detached; the task ends when the child's stderr closes.
        drop(spawn_stderr_drain(
            conn.pid,
            conn.stderr,
            Arc::clone(&self.stderr),
        ));

        let (queue, requests) = mpsc::channel(WRITE_QUEUE_DEPTH);
        drop(tokio::spawn(run_writer(conn.pid, conn.stdin, requests)));
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(queue);
        *self.child.lock().await = Some(conn.child);
        self.pid.store(conn.pid, Ordering::SeqCst);

        if self.cancel.is_cancelled() {
            // stop() raced with this launch; it may have missed the new child.
            if let Some(mut child) = self.child.lock().await.take() {
                terminate_child(&mut child, self.config.stop_grace()).await;
            }
            return Err(AppError::ProcessUnavailable("supervisor stopped during launch".into()));
        }

        self.set_state(ProcessState::Running);
        Ok(conn.stdout)
    }

    async fn supervise(self: Arc<Self>, stdout: ChildStdout, listener: Arc<dyn ChildListener>) {
        let mut stdout = stdout;
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let pid = self.pid();
            let outcome = run_reader(
                pid,
                stdout,
                self.config.max_line_bytes,
                listener.as_ref(),
                &self.cancel,
            )
            .await;

            if outcome == ReadOutcome::Cancelled || self.cancel.is_cancelled() {
                debug!(pid, "supervision ended by stop request");
                return;
            }

            // Pending requests are failed before the child is reaped.
            let reason = exit_reason(pid, &outcome);
            self.close_stdin();
            self.set_state(ProcessState::Crashed);
            listener.on_exit(&reason);

            let status = self.reap().await;
            warn!(
                pid,
                reason = %reason,
                status = %describe_exit(status),
                stderr = ?self.stderr.tail(CRASH_STDERR_LINES),
                "child process crashed"
            );

            if started.elapsed() >= self.restart.stable_after() {
                attempt = 0;
            }

            stdout = match self.relaunch(&mut attempt).await {
                Some(stdout) => stdout,
                None => return,
            };
        }
    }

    /// Retry launching until success, retry exhaustion, or cancellation.
    async fn relaunch(&self, attempt: &mut u32) -> Option<ChildStdout> {
        loop {
            *attempt += 1;
            if *attempt > self.restart.max_retries {
                error!(
                    max_retries = self.restart.max_retries,
                    "restart budget exhausted, child stays stopped"
                );
                self.set_state(ProcessState::Stopped);
                return None;
            }

            let delay = self.restart.backoff(*attempt);
            info!(attempt = *attempt, ?delay, "restarting child process");
            tokio::select! {
                () = self.cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            match self.launch().await {
                Ok(stdout) => {
                    self.restarts.fetch_add(1, Ordering::SeqCst);
                    info!(pid = self.pid(), attempt = *attempt, "child process restarted");
                    return Some(stdout);
                }
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        return None;
                    }
                    warn!(%err, attempt = *attempt, "restart attempt failed");
                    self.set_state(ProcessState::Crashed);
                }
            }
        }
    }

    /// Release the process of a child whose output ended.
    async fn reap(&self) -> Option<ExitStatus> {
        let child = self.child.lock().await.take();
        self.pid.store(0, Ordering::SeqCst);

        match child {
            Some(mut child) => terminate_child(&mut child, self.config.stop_grace()).await,
            None => None,
        }
    }
}

fn exit_reason(pid: u32, outcome: &ReadOutcome) -> String {
    match outcome {
        ReadOutcome::Failed(err) => format!("child {pid} stdout read failed: {err}"),
        ReadOutcome::Eof | ReadOutcome::Cancelled => format!("child {pid} stdout closed"),
    }
}

/// Wait for `child` to exit, escalating from `SIGTERM` to a kill after `grace`.
async fn terminate_child(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    send_terminate(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            warn!(%err, "error waiting for child process");
            None
        }
        Err(_) => {
            warn!("child process did not exit within grace period, forcing kill");
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to force-kill child process");
            }
            child.try_wait().ok().flatten()
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid = raw, %err, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

fn describe_exit(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) if status.success() => "exited normally (code 0)".to_owned(),
        Some(status) => status.code().map_or_else(
            || "terminated by signal".to_owned(),
            |c| format!("exited with code {c}"),
        ),
        None => "status unknown".to_owned(),
    }
}
