//! Request/response correlation between sessions and the child process.
//!
//! Every client request is given a bridge-unique integer wire id before it
//! reaches the child, so two sessions that both send `"id": 1` never collide.
//! The wire id doubles as the request's progress token when the client asked
//! for progress. Responses, progress notifications and child-side
//! cancellations are mapped back to the originating session and the client's
//! own id and token are restored.
//!
//! The pending table and the session table are never locked together.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::MAX_TIMEOUT_SECONDS;
use crate::errors::INTERNAL_ERROR;
use crate::jsonrpc::message::cancellation_params;
use crate::jsonrpc::{ErrorObject, Message, Notification, Request, RequestId, Response};
use crate::process::{ChildListener, ProcessSupervisor};
use crate::session::SessionManager;
use crate::{AppError, Result};

/// Related notifications buffered per streaming request.
const RELATED_BUFFER: usize = 64;

/// Outbound channel to the child process.
pub trait ChildWriter: Send + Sync {
    /// Write one message to the child.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessUnavailable` if the child cannot accept it.
    fn send<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

impl ChildWriter for ProcessSupervisor {
    fn send<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.write(message))
    }
}

#[derive(Debug)]
struct PendingRequest {
    session_id: String,
    client_id: RequestId,
    method: String,
    client_token: Option<Value>,
    deadline: Instant,
    result_tx: oneshot::Sender<Result<Response>>,
    related_tx: Option<mpsc::Sender<Message>>,
}

#[derive(Debug, Default)]
struct PendingTable {
    /// Keyed by wire id.
    requests: HashMap<RequestId, PendingRequest>,
    /// `(session, client id)` to wire id.
    by_client: HashMap<(String, RequestId), RequestId>,
    /// Child-originated requests still waiting for a client answer.
    outbound: HashMap<RequestId, Instant>,
}

impl PendingTable {
    fn take(&mut self, wire_id: &RequestId) -> Option<PendingRequest> {
        let entry = self.requests.remove(wire_id)?;
        self.by_client
            .remove(&(entry.session_id.clone(), entry.client_id.clone()));
        Some(entry)
    }
}

/// Where a routed notification should go.
struct Route {
    session_id: String,
    related_tx: Option<mpsc::Sender<Message>>,
}

/// Matches child output to pending client requests.
pub struct Correlator {
    table: Mutex<PendingTable>,
    sessions: Arc<SessionManager>,
    writer: Arc<dyn ChildWriter>,
    request_timeout: Duration,
    cancel_method: Option<String>,
    next_wire_id: AtomicI64,
}

impl Correlator {
    /// Create a correlator writing to `writer`.
    ///
    /// `request_timeout` is clamped to [`MAX_TIMEOUT_SECONDS`].
    #[must_use]
    pub fn new(
        sessions: Arc<SessionManager>,
        writer: Arc<dyn ChildWriter>,
        request_timeout: Duration,
        cancel_method: Option<String>,
    ) -> Self {
        Self {
            table: Mutex::new(PendingTable::default()),
            sessions,
            writer,
            request_timeout: request_timeout.min(Duration::from_secs(MAX_TIMEOUT_SECONDS)),
            cancel_method,
            next_wire_id: AtomicI64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `request` for `session_id` and write it to the child.
    ///
    /// With `stream_related`, notifications tied to this request are
    /// delivered through the returned handle instead of the session stream.
    ///
    /// # Errors
    ///
    /// Returns a session error if the session is not live,
    /// `AppError::DuplicateRequestId` if the id is already pending in this
    /// session, and `AppError::ProcessUnavailable` if the write fails.
    pub async fn submit(
        self: &Arc<Self>,
        session_id: &str,
        request: Request,
        stream_related: bool,
    ) -> Result<PendingResponse> {
        self.sessions.touch(session_id)?;

        let mut request = request;
        let client_id = request.id.clone();
        let wire_id = RequestId::Number(self.next_wire_id.fetch_add(1, Ordering::SeqCst));
        let (result_tx, result_rx) = oneshot::channel();
        let (related_tx, related_rx) = if stream_related {
            let (tx, rx) = mpsc::channel(RELATED_BUFFER);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        {
            let mut table = self.lock();
            let key = (session_id.to_owned(), client_id.clone());
            if table.by_client.contains_key(&key) {
                return Err(AppError::DuplicateRequestId(format!(
                    "request {client_id} is already pending in session {session_id}"
                )));
            }
            table.by_client.insert(key, wire_id.clone());
            table.requests.insert(
                wire_id.clone(),
                PendingRequest {
                    session_id: session_id.to_owned(),
                    client_id: client_id.clone(),
                    method: request.method.clone(),
                    client_token: request.progress_token().cloned(),
                    deadline: Instant::now() + self.request_timeout,
                    result_tx,
                    related_tx,
                },
            );
        }

        if let Err(err) = self.sessions.track(session_id, wire_id.clone()) {
            self.lock().take(&wire_id);
            return Err(err);
        }

        let mut handle = PendingResponse {
            wire_id: wire_id.clone(),
            client_id: client_id.clone(),
            session_id: session_id.to_owned(),
            result_rx,
            related_rx,
            correlator: Arc::clone(self),
            settled: false,
        };

        if request.progress_token().is_some() {
            request.set_progress_token(wire_id.to_value());
        }
        request.id = wire_id.clone();
        debug!(
            session_id,
            request_id = %client_id,
            wire_id = %wire_id,
            method = %request.method,
            "forwarding request to child"
        );

        if let Err(err) = self.writer.send(&Message::Request(request)).await {
            handle.settled = true;
            self.unregister(&wire_id);
            warn!(session_id, request_id = %client_id, %err, "request write failed");
            return Err(err);
        }

        Ok(handle)
    }

    /// Forward a client notification or response to the child.
    ///
    /// Client responses are only forwarded when they answer an outstanding
    /// child-originated request; the first answer wins.
    ///
    /// # Errors
    ///
    /// Returns a session error if the session is not live,
    /// `AppError::MalformedMessage` for requests, and
    /// `AppError::ProcessUnavailable` if the write fails.
    pub async fn forward(&self, session_id: &str, message: Message) -> Result<()> {
        self.sessions.touch(session_id)?;

        match message {
            Message::Request(_) => Err(AppError::MalformedMessage(
                "requests must be submitted, not forwarded".into(),
            )),
            Message::Response(response) => {
                let outstanding = self.lock().outbound.remove(&response.id).is_some();
                if !outstanding {
                    debug!(
                        session_id,
                        request_id = %response.id,
                        "dropping client response with no outstanding child request"
                    );
                    return Ok(());
                }
                self.writer.send(&Message::Response(response)).await
            }
            Message::Notification(mut note) => {
                if let Some(client_id) = note.cancelled_request_id() {
                    let key = (session_id.to_owned(), client_id);
                    let entry = {
                        let mut table = self.lock();
                        let wire_id = table.by_client.get(&key).cloned();
                        wire_id.and_then(|wire_id| table.take(&wire_id).map(|entry| (wire_id, entry)))
                    };
                    let Some((wire_id, entry)) = entry else {
                        debug!(session_id, "client cancelled a request that is not pending");
                        return Ok(());
                    };
                    self.sessions.untrack(session_id, &wire_id);
                    info!(session_id, request_id = %entry.client_id, "request cancelled by client");
                    let _ = entry.result_tx.send(Err(AppError::Cancelled(
                        "cancelled by client".into(),
                    )));
                    note.set_cancelled_request_id(&wire_id);
                }
                self.writer.send(&Message::Notification(note)).await
            }
        }
    }

    /// Resolve every request whose deadline is at or before `now` with
    /// `RequestTimeout` and tell the child. Returns how many expired.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<(RequestId, PendingRequest)> = {
            let mut table = self.lock();
            let ids: Vec<RequestId> = table
                .requests
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            let timeout = self.request_timeout;
            table
                .outbound
                .retain(|_, issued| now.saturating_duration_since(*issued) < timeout);
            ids.into_iter()
                .filter_map(|id| table.take(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (wire_id, entry) in expired {
            self.sessions.untrack(&entry.session_id, &wire_id);
            warn!(
                session_id = %entry.session_id,
                request_id = %entry.client_id,
                method = %entry.method,
                "request timed out"
            );
            let _ = entry.result_tx.send(Err(AppError::RequestTimeout(format!(
                "no response within {}s",
                self.request_timeout.as_secs()
            ))));
            self.notify_cancelled(&wire_id, "request timed out");
        }
        count
    }

    /// Abandon one pending request and tell the child.
    ///
    /// Returns `false` if the request had already resolved. A late response
    /// from the child is discarded.
    pub fn cancel(&self, wire_id: &RequestId, reason: &str) -> bool {
        let Some(entry) = self.lock().take(wire_id) else {
            return false;
        };
        self.sessions.untrack(&entry.session_id, wire_id);
        debug!(
            session_id = %entry.session_id,
            request_id = %entry.client_id,
            reason,
            "request cancelled"
        );
        let _ = entry.result_tx.send(Err(AppError::Cancelled(reason.to_owned())));
        self.notify_cancelled(wire_id, reason);
        true
    }

    /// Cancel every pending request of one session.
    pub fn cancel_session(&self, wire_ids: &HashSet<RequestId>, reason: &str) -> usize {
        wire_ids
            .iter()
            .filter(|wire_id| self.cancel(wire_id, reason))
            .count()
    }

    /// Resolve every pending request with the error built by `make_err` and
    /// forget outstanding child requests.
    pub fn fail_all<F>(&self, make_err: F) -> usize
    where
        F: Fn() -> AppError,
    {
        let drained: Vec<(RequestId, PendingRequest)> = {
            let mut table = self.lock();
            table.by_client.clear();
            table.outbound.clear();
            table.requests.drain().collect()
        };

        let count = drained.len();
        for (wire_id, entry) in drained {
            self.sessions.untrack(&entry.session_id, &wire_id);
            let _ = entry.result_tx.send(Err(make_err()));
        }
        count
    }

    /// Number of client requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Number of child-originated requests awaiting a client answer.
    #[must_use]
    pub fn outbound_count(&self) -> usize {
        self.lock().outbound.len()
    }

    /// Remove an entry that never reached the child.
    fn unregister(&self, wire_id: &RequestId) {
        let entry = self.lock().take(wire_id);
        if let Some(entry) = entry {
            self.sessions.untrack(&entry.session_id, wire_id);
        }
    }

    fn resolve(&self, response: Response) {
        let Some(entry) = self.lock().take(&response.id) else {
            warn!(wire_id = %response.id, "dropping response with unknown id");
            return;
        };
        self.sessions.untrack(&entry.session_id, &response.id);

        trace!(
            session_id = %entry.session_id,
            request_id = %entry.client_id,
            is_error = response.is_error(),
            "response matched"
        );
        let restored = Response {
            id: entry.client_id.clone(),
            payload: response.payload,
        };
        if entry.result_tx.send(Ok(restored)).is_err() {
            debug!(
                session_id = %entry.session_id,
                request_id = %entry.client_id,
                "response arrived after the caller left"
            );
        }
    }

    fn route_notification(&self, note: Notification) {
        let mut note = note;

        if let Some(token) = note.progress_token().and_then(RequestId::from_value) {
            let route = {
                let table = self.lock();
                table.requests.get(&token).and_then(|entry| {
                    entry.client_token.clone().map(|client_token| {
                        (
                            client_token,
                            Route {
                                session_id: entry.session_id.clone(),
                                related_tx: entry.related_tx.clone(),
                            },
                        )
                    })
                })
            };
            if let Some((client_token, route)) = route {
                note.set_progress_token(client_token);
                self.deliver_related(&route, Message::Notification(note));
                return;
            }
        }

        if let Some(wire_id) = note.cancelled_request_id() {
            let entry = self.lock().take(&wire_id);
            if let Some(entry) = entry {
                self.sessions.untrack(&entry.session_id, &wire_id);
                note.set_cancelled_request_id(&entry.client_id);
                let route = Route {
                    session_id: entry.session_id.clone(),
                    related_tx: entry.related_tx.clone(),
                };
                self.deliver_related(&route, Message::Notification(note));
                info!(
                    session_id = %entry.session_id,
                    request_id = %entry.client_id,
                    "request cancelled by child"
                );
                let _ = entry
                    .result_tx
                    .send(Err(AppError::Cancelled("cancelled by server".into())));
                return;
            }
        }

        let delivered = self.sessions.broadcast(&Message::Notification(note));
        trace!(delivered, "notification broadcast");
    }

    fn route_child_request(&self, request: Request) {
        let id = request.id.clone();
        let method = request.method.clone();
        self.lock().outbound.insert(id.clone(), Instant::now());

        let delivered = self.sessions.broadcast(&Message::Request(request));
        if delivered > 0 {
            debug!(request_id = %id, method = %method, delivered, "child request broadcast");
            return;
        }

        self.lock().outbound.remove(&id);
        warn!(request_id = %id, method = %method, "no client stream to answer child request");
        let reply = Message::Response(Response::error(
            id,
            ErrorObject::new(INTERNAL_ERROR, "no client connected to answer request"),
        ));
        self.spawn_write(reply);
    }

    fn deliver_related(&self, route: &Route, message: Message) {
        let message = match &route.related_tx {
            Some(tx) => match tx.try_send(message) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(m) | mpsc::error::TrySendError::Closed(m)) => m,
            },
            None => message,
        };
        if !self.sessions.deliver(&route.session_id, message) {
            trace!(session_id = %route.session_id, "related notification had no open stream");
        }
    }

    fn notify_cancelled(&self, wire_id: &RequestId, reason: &str) {
        let Some(method) = self.cancel_method.as_deref() else {
            return;
        };
        let note = Notification::new(method, Some(cancellation_params(wire_id, reason)));
        self.spawn_write(Message::Notification(note));
    }

    /// Write to the child in the background; failures are logged.
    fn spawn_write(&self, message: Message) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime available, skipping background write to child");
            return;
        };
        let writer = Arc::clone(&self.writer);
        drop(runtime.spawn(async move {
            if let Err(err) = writer.send(&message).await {
                debug!(%err, kind = message.kind(), "background write to child failed");
            }
        }));
    }
}

impl ChildListener for Correlator {
    fn on_message(&self, message: Message) {
        match message {
            Message::Response(response) => self.resolve(response),
            Message::Notification(note) => self.route_notification(note),
            Message::Request(request) => self.route_child_request(request),
        }
    }

    fn on_exit(&self, reason: &str) {
        let failed = self.fail_all(|| AppError::ProcessCrashed(reason.to_owned()));
        if failed > 0 {
            warn!(failed, reason, "pending requests failed by child exit");
        }
    }
}

/// One step of a pending request as seen by its caller.
#[derive(Debug)]
pub enum PendingEvent {
    /// A notification tied to the request, in emission order.
    Related(Message),
    /// The final outcome; no further events follow.
    Done(Result<Response>),
}

/// Handle to an in-flight request.
///
/// Dropping the handle before the final outcome cancels the request.
#[derive(Debug)]
pub struct PendingResponse {
    wire_id: RequestId,
    client_id: RequestId,
    session_id: String,
    result_rx: oneshot::Receiver<Result<Response>>,
    related_rx: Option<mpsc::Receiver<Message>>,
    correlator: Arc<Correlator>,
    settled: bool,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

enum Step {
    Related(Option<Message>),
    Done(Result<Response>),
}

impl PendingResponse {
    /// Id the client used for this request.
    #[must_use]
    pub fn client_id(&self) -> &RequestId {
        &self.client_id
    }

    /// Session that issued the request.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the next related notification or the final outcome.
    ///
    /// Related notifications queued before the response are always yielded
    /// first.
    pub async fn next_event(&mut self) -> PendingEvent {
        if self.settled {
            return PendingEvent::Done(Err(AppError::Cancelled(
                "request already resolved".into(),
            )));
        }

        loop {
            let step = {
                let related_rx = &mut self.related_rx;
                let result_rx = &mut self.result_rx;
                let related = async {
                    match related_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    biased;

                    message = related => Step::Related(message),
                    outcome = result_rx => Step::Done(outcome.unwrap_or_else(|_| {
                        Err(AppError::Cancelled("request abandoned by the bridge".into()))
                    })),
                }
            };

            match step {
                Step::Related(Some(message)) => return PendingEvent::Related(message),
                Step::Related(None) => self.related_rx = None,
                Step::Done(outcome) => {
                    self.settled = true;
                    return PendingEvent::Done(outcome);
                }
            }
        }
    }

    /// Wait for the final outcome, discarding related notifications.
    ///
    /// # Errors
    ///
    /// Returns the error the request resolved with.
    pub async fn response(mut self) -> Result<Response> {
        loop {
            if let PendingEvent::Done(outcome) = self.next_event().await {
                return outcome;
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.settled && self.correlator.cancel(&self.wire_id, "client disconnected") {
            debug!(
                session_id = %self.session_id,
                request_id = %self.client_id,
                "pending request dropped before completion"
            );
        }
    }
}
