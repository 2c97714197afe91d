//! Composition root tying the supervisor, correlator and session table
//! together.
//!
//! The transport layer talks only to [`Bridge`]. Session termination is
//! ordered here: pending requests are cancelled before the stream sink is
//! released, so no response can be routed to a session that no longer
//! exists.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::BridgeConfig;
use crate::correlator::{ChildWriter, Correlator, PendingResponse};
use crate::jsonrpc::{Message, Request};
use crate::process::{ChildListener, ProcessState, ProcessSupervisor};
use crate::session::{EventStream, RemovedSession, SessionManager};
use crate::{AppError, Result};

/// Status report served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Child process state.
    pub process: ProcessState,
    /// OS pid of the child, 0 when none is running.
    pub pid: u32,
    /// Restarts since the bridge started.
    pub restarts: u32,
    /// Live sessions.
    pub sessions: usize,
    /// Client requests awaiting a response.
    pub pending: usize,
}

/// Shared bridge state.
#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    supervisor: Arc<ProcessSupervisor>,
    sessions: Arc<SessionManager>,
    correlator: Arc<Correlator>,
}

impl Bridge {
    /// Build the bridge from validated configuration. Nothing is spawned
    /// until [`start`](Self::start).
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.process.clone(),
            config.restart.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            config.timeouts.session_idle(),
            config.sessions.stream_buffer,
            config.sessions.accept_client_session_ids,
        ));
        let writer: Arc<dyn ChildWriter> = Arc::clone(&supervisor) as _;
        let correlator = Arc::new(Correlator::new(
            Arc::clone(&sessions),
            writer,
            config.timeouts.request(),
            config.cancel_method().map(str::to_owned),
        ));

        Self {
            config,
            supervisor,
            sessions,
            correlator,
        }
    }

    /// Launch the child process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessUnavailable` if the child cannot be spawned.
    pub async fn start(&self) -> Result<()> {
        let listener: Arc<dyn ChildListener> = Arc::clone(&self.correlator) as _;
        self.supervisor.start(listener).await?;
        info!(
            pid = self.supervisor.pid(),
            command = %self.config.process.command,
            "bridge started"
        );
        Ok(())
    }

    /// Configuration the bridge was built from.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Session table.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Correlator.
    #[must_use]
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Process supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Resolve or create the session named by an inbound request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` or `AppError::SessionExpired`.
    pub fn open_session(&self, token: Option<&str>) -> Result<String> {
        self.sessions.open(token)
    }

    /// Submit a client request.
    ///
    /// # Errors
    ///
    /// See [`Correlator::submit`].
    pub async fn submit(
        &self,
        session_id: &str,
        request: Request,
        stream_related: bool,
    ) -> Result<PendingResponse> {
        self.correlator
            .submit(session_id, request, stream_related)
            .await
    }

    /// Forward a client notification or response.
    ///
    /// # Errors
    ///
    /// See [`Correlator::forward`].
    pub async fn forward(&self, session_id: &str, message: Message) -> Result<()> {
        self.correlator.forward(session_id, message).await
    }

    /// Open the session's server-to-client stream, replacing any existing one.
    ///
    /// # Errors
    ///
    /// Returns a session error if the session is not live.
    pub fn open_stream(&self, session_id: &str) -> Result<EventStream> {
        self.sessions.attach_stream(session_id)
    }

    /// Terminate a session: cancel its pending requests, then release its
    /// stream.
    ///
    /// # Errors
    ///
    /// Returns a session error if the session is not live.
    pub fn close_session(&self, session_id: &str, reason: &str) -> Result<()> {
        let removed = self.sessions.remove(session_id)?;
        self.release(session_id, removed, reason);
        Ok(())
    }

    fn release(&self, session_id: &str, removed: RemovedSession, reason: &str) {
        let cancelled = self.correlator.cancel_session(&removed.pending, reason);
        drop(removed.stream);
        info!(session_id, cancelled, reason, "session terminated");
    }

    /// Expire overdue requests and idle sessions at `now`.
    pub fn sweep(&self, now: Instant) {
        let timed_out = self.correlator.sweep_expired(now);
        if timed_out > 0 {
            debug!(timed_out, "expired pending requests");
        }

        for session_id in self.sessions.expired(now) {
            match self.sessions.remove_if_expired(&session_id, now) {
                Some(removed) => self.release(&session_id, removed, "session idle timeout"),
                None => debug!(session_id = %session_id, "idle session resumed or already gone"),
            }
        }
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `cancel` fires.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        let period = self.config.timeouts.sweep_interval();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            debug!("sweeper stopped");
                            return;
                        }
                        _ = ticker.tick() => bridge.sweep(Instant::now()),
                    }
                }
            }
            .instrument(info_span!("sweeper")),
        )
    }

    /// Fail all pending requests and end every event stream. Idempotent.
    pub fn drain(&self) {
        let failed = self
            .correlator
            .fail_all(|| AppError::ProcessUnavailable("bridge shutting down".into()));
        if failed > 0 {
            warn!(failed, "pending requests abandoned at shutdown");
        }
        let closed = self.sessions.detach_all();
        if closed > 0 {
            debug!(closed, "event streams closed at shutdown");
        }
    }

    /// Drain and stop the child.
    pub async fn shutdown(&self) {
        self.drain();
        self.supervisor.stop().await;
        info!("bridge stopped");
    }

    /// Current status.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport {
            process: self.supervisor.state(),
            pid: self.supervisor.pid(),
            restarts: self.supervisor.restarts(),
            sessions: self.sessions.len(),
            pending: self.correlator.pending_count(),
        }
    }
}
