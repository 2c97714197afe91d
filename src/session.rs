//! Session table and event-stream sinks.
//!
//! A session is a logical client connection identified by an opaque token.
//! It tracks the wire ids of its in-flight requests and holds at most one
//! event-stream sink. Lifecycle:
//!
//! | State     | Condition                                            |
//! |-----------|------------------------------------------------------|
//! | `Active`  | an open event stream or at least one pending request |
//! | `Idle`    | neither; idle clock running                          |
//! | `Expired` | idle for longer than the configured ceiling          |
//!
//! Removed sessions are tombstoned so their ids are never reused and report
//! [`AppError::SessionExpired`] instead of [`AppError::SessionNotFound`].
//!
//! Opening a second stream on a session replaces the first: the old sink is
//! dropped, which ends the old stream.
//!
//! Delivery never blocks. A sink whose buffer is full drops the message for
//! that session only.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::jsonrpc::{Message, RequestId};
use crate::{AppError, Result};

/// Tombstones outlive their session by this many idle periods.
const TOMBSTONE_IDLE_MULTIPLIER: u32 = 10;

/// Longest client-supplied session token accepted.
const MAX_TOKEN_LEN: usize = 128;

/// Derived lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Has an open stream or pending requests.
    Active,
    /// Nothing in flight; idle clock running.
    Idle,
    /// Idle beyond the ceiling; will be terminated.
    Expired,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session token.
    pub id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Derived state.
    pub state: SessionState,
    /// Number of in-flight requests.
    pub pending: usize,
    /// Whether an event stream is attached.
    pub has_stream: bool,
}

/// What remains of a session after it is removed from the table.
#[derive(Debug)]
pub struct RemovedSession {
    /// Wire ids that were still pending; the caller must cancel them.
    pub pending: HashSet<RequestId>,
    /// The stream sink, released only after pending requests are cancelled.
    pub stream: Option<mpsc::Sender<Message>>,
}

#[derive(Debug)]
struct StreamSlot {
    generation: u64,
    tx: mpsc::Sender<Message>,
}

#[derive(Debug)]
struct Session {
    created_at: DateTime<Utc>,
    last_activity: Instant,
    pending: HashSet<RequestId>,
    stream: Option<StreamSlot>,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            created_at: Utc::now(),
            last_activity: now,
            pending: HashSet::new(),
            stream: None,
        }
    }

    fn state(&self, now: Instant, idle_timeout: Duration) -> SessionState {
        if self.stream.is_some() || !self.pending.is_empty() {
            SessionState::Active
        } else if now.saturating_duration_since(self.last_activity) >= idle_timeout {
            SessionState::Expired
        } else {
            SessionState::Idle
        }
    }

    /// Offer `message` to the stream sink without waiting.
    fn offer(&mut self, session_id: &str, message: Message) -> bool {
        let Some(slot) = &self.stream else {
            return false;
        };
        match slot.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    session_id,
                    kind = dropped.kind(),
                    "event stream buffer full, dropping message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id, "event stream closed, detaching");
                self.stream = None;
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct SessionTable {
    live: HashMap<String, Session>,
    terminated: HashMap<String, Instant>,
}

impl SessionTable {
    /// Error for an id that is not live.
    fn missing(&self, id: &str) -> AppError {
        if self.terminated.contains_key(id) {
            AppError::SessionExpired(format!("session {id} has ended"))
        } else {
            AppError::SessionNotFound(format!("session {id} not found"))
        }
    }

    fn tombstone(&mut self, id: &str, now: Instant) -> Option<Session> {
        let session = self.live.remove(id)?;
        self.terminated.insert(id.to_owned(), now);
        Some(session)
    }
}

/// Concurrent session table.
#[derive(Debug)]
pub struct SessionManager {
    table: Mutex<SessionTable>,
    idle_timeout: Duration,
    tombstone_ttl: Duration,
    stream_buffer: usize,
    accept_client_ids: bool,
    next_generation: AtomicU64,
}

impl SessionManager {
    /// Create an empty table.
    #[must_use]
    pub fn new(idle_timeout: Duration, stream_buffer: usize, accept_client_ids: bool) -> Self {
        Self {
            table: Mutex::new(SessionTable::default()),
            idle_timeout,
            tombstone_ttl: idle_timeout.saturating_mul(TOMBSTONE_IDLE_MULTIPLIER),
            stream_buffer: stream_buffer.max(1),
            accept_client_ids,
            next_generation: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a session with a fresh server-issued token.
    #[must_use]
    pub fn create(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.lock().live.insert(id.clone(), Session::new(Instant::now()));
        info!(session_id = %id, "session created");
        id
    }

    /// Resolve the session for an incoming request.
    ///
    /// No token creates a session. A known token is touched. An unknown
    /// token is adopted only when client-supplied ids are accepted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` or `AppError::SessionExpired` when
    /// the token cannot be used.
    pub fn open(&self, token: Option<&str>) -> Result<String> {
        let Some(token) = token else {
            return Ok(self.create());
        };

        match self.touch(token) {
            Err(AppError::SessionNotFound(_)) if self.accept_client_ids && is_valid_token(token) => {
                let mut table = self.lock();
                if table.terminated.contains_key(token) {
                    return Err(table.missing(token));
                }
                table
                    .live
                    .entry(token.to_owned())
                    .or_insert_with(|| Session::new(Instant::now()));
                drop(table);
                info!(session_id = token, "session created from client token");
                Ok(token.to_owned())
            }
            Err(err) => Err(err),
            Ok(()) => Ok(token.to_owned()),
        }
    }

    /// Record activity on a session.
    ///
    /// A session found idle beyond the ceiling is terminated on the spot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for unknown ids and
    /// `AppError::SessionExpired` for terminated or expired sessions.
    pub fn touch(&self, id: &str) -> Result<()> {
        let now = Instant::now();
        let mut table = self.lock();
        let state = match table.live.get(id) {
            Some(session) => session.state(now, self.idle_timeout),
            None => return Err(table.missing(id)),
        };

        if state == SessionState::Expired {
            table.tombstone(id, now);
            drop(table);
            info!(session_id = id, "session expired on access");
            return Err(AppError::SessionExpired(format!("session {id} expired")));
        }

        if let Some(session) = table.live.get_mut(id) {
            session.last_activity = now;
        }
        Ok(())
    }

    /// Add a wire id to the session's pending set.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`touch`](Self::touch).
    pub fn track(&self, id: &str, wire_id: RequestId) -> Result<()> {
        let mut table = self.lock();
        let Some(session) = table.live.get_mut(id) else {
            return Err(table.missing(id));
        };
        session.pending.insert(wire_id);
        session.last_activity = Instant::now();
        Ok(())
    }

    /// Remove a wire id from the session's pending set; no-op if either is gone.
    pub fn untrack(&self, id: &str, wire_id: &RequestId) {
        if let Some(session) = self.lock().live.get_mut(id) {
            session.pending.remove(wire_id);
            session.last_activity = Instant::now();
        }
    }

    /// Attach a new event stream, replacing any existing one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` / `AppError::SessionExpired` when
    /// the session is not live.
    pub fn attach_stream(self: &Arc<Self>, id: &str) -> Result<EventStream> {
        let now = Instant::now();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.stream_buffer);

        let mut table = self.lock();
        let state = match table.live.get(id) {
            Some(session) => session.state(now, self.idle_timeout),
            None => return Err(table.missing(id)),
        };
        if state == SessionState::Expired {
            table.tombstone(id, now);
            return Err(AppError::SessionExpired(format!("session {id} expired")));
        }

        let Some(session) = table.live.get_mut(id) else {
            return Err(table.missing(id));
        };
        let replaced = session.stream.replace(StreamSlot { generation, tx }).is_some();
        session.last_activity = now;
        drop(table);

        if replaced {
            info!(session_id = id, "event stream replaced by a newer connection");
        } else {
            debug!(session_id = id, "event stream attached");
        }

        Ok(EventStream {
            session_id: id.to_owned(),
            generation,
            rx,
            manager: Arc::downgrade(self),
        })
    }

    /// Detach the stream with `generation`; a newer stream is left alone.
    pub fn detach_stream(&self, id: &str, generation: u64) {
        let mut table = self.lock();
        let Some(session) = table.live.get_mut(id) else {
            return;
        };
        if session
            .stream
            .as_ref()
            .is_some_and(|slot| slot.generation == generation)
        {
            session.stream = None;
            session.last_activity = Instant::now();
            drop(table);
            debug!(session_id = id, "event stream detached");
        }
    }

    /// Deliver `message` to one session's stream.
    ///
    /// Returns `false` if the session has no stream or its buffer is full.
    pub fn deliver(&self, id: &str, message: Message) -> bool {
        let mut table = self.lock();
        match table.live.get_mut(id) {
            Some(session) => session.offer(id, message),
            None => false,
        }
    }

    /// Deliver `message` to every session with an open stream.
    ///
    /// Returns the number of streams that accepted it.
    pub fn broadcast(&self, message: &Message) -> usize {
        let mut table = self.lock();
        table
            .live
            .iter_mut()
            .filter(|(_, session)| session.stream.is_some())
            .map(|(id, session)| session.offer(id, message.clone()))
            .filter(|delivered| *delivered)
            .count()
    }

    /// Drop every stream sink, ending all open streams. Returns how many
    /// were attached.
    pub fn detach_all(&self) -> usize {
        let now = Instant::now();
        let mut table = self.lock();
        let mut closed = 0;
        for session in table.live.values_mut() {
            if session.stream.take().is_some() {
                session.last_activity = now;
                closed += 1;
            }
        }
        closed
    }

    /// Ids of sessions idle beyond the ceiling at `now`. Also forgets
    /// tombstones older than their retention period.
    #[must_use]
    pub fn expired(&self, now: Instant) -> Vec<String> {
        let mut table = self.lock();
        let ttl = self.tombstone_ttl;
        table
            .terminated
            .retain(|_, ended| now.saturating_duration_since(*ended) < ttl);
        table
            .live
            .iter()
            .filter(|(_, session)| session.state(now, self.idle_timeout) == SessionState::Expired)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Remove a live session and tombstone its id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` / `AppError::SessionExpired` if
    /// the session is not live.
    pub fn remove(&self, id: &str) -> Result<RemovedSession> {
        let mut table = self.lock();
        let Some(session) = table.tombstone(id, Instant::now()) else {
            return Err(table.missing(id));
        };
        Ok(RemovedSession {
            pending: session.pending,
            stream: session.stream.map(|slot| slot.tx),
        })
    }

    /// Remove and tombstone a session only if it is still expired at `now`.
    ///
    /// Returns `None` when the session is gone or saw activity since it was
    /// listed by [`expired`](Self::expired).
    pub fn remove_if_expired(&self, id: &str, now: Instant) -> Option<RemovedSession> {
        let mut table = self.lock();
        let expired = table
            .live
            .get(id)
            .is_some_and(|session| session.state(now, self.idle_timeout) == SessionState::Expired);
        if !expired {
            return None;
        }
        let session = table.tombstone(id, now)?;
        Some(RemovedSession {
            pending: session.pending,
            stream: session.stream.map(|slot| slot.tx),
        })
    }

    /// Derived state of one session, if live.
    #[must_use]
    pub fn state_of(&self, id: &str) -> Option<SessionState> {
        let now = Instant::now();
        self.lock()
            .live
            .get(id)
            .map(|session| session.state(now, self.idle_timeout))
    }

    /// Number of pending requests of one session, if live.
    #[must_use]
    pub fn pending_of(&self, id: &str) -> Option<usize> {
        self.lock().live.get(id).map(|session| session.pending.len())
    }

    /// Whether `id` has an attached event stream.
    #[must_use]
    pub fn has_stream(&self, id: &str) -> bool {
        self.lock()
            .live
            .get(id)
            .is_some_and(|session| session.stream.is_some())
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }

    /// Snapshot of every live session.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        self.lock()
            .live
            .iter()
            .map(|(id, session)| SessionInfo {
                id: id.clone(),
                created_at: session.created_at,
                state: session.state(now, self.idle_timeout),
                pending: session.pending.len(),
                has_stream: session.stream.is_some(),
            })
            .collect()
    }
}

/// Server-to-client message stream of one session.
///
/// Dropping it detaches the sink from the session unless a newer stream has
/// already replaced it.
#[derive(Debug)]
pub struct EventStream {
    session_id: String,
    generation: u64,
    rx: mpsc::Receiver<Message>,
    manager: Weak<SessionManager>,
}

impl EventStream {
    /// Session this stream belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Receive the next message; `None` once the stream is replaced or the
    /// session ends.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.detach_stream(&self.session_id, self.generation);
        }
    }
}

/// Client-supplied tokens must be visible ASCII.
fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token.bytes().all(|b| (0x21..=0x7e).contains(&b))
}
