//! Unit tests for the session table: lifecycle, tombstones, and streams.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use mcp_stdio_bridge::jsonrpc::{Message, Notification, RequestId};
use mcp_stdio_bridge::session::{SessionManager, SessionState};
use mcp_stdio_bridge::AppError;

fn manager() -> Arc<SessionManager> {
    Arc::new(SessionManager::new(Duration::from_secs(60), 8, false))
}

fn note(text: &str) -> Message {
    Message::Notification(Notification::new(
        "notifications/message",
        Some(json!({"data": text})),
    ))
}

#[test]
fn open_without_token_creates_session() {
    let sessions = manager();

    let id = sessions.open(None).expect("create");

    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions.state_of(&id), Some(SessionState::Idle));
    assert!(uuid::Uuid::parse_str(&id).is_ok(), "server ids are uuids");
}

#[test]
fn open_with_known_token_reuses_session() {
    let sessions = manager();
    let id = sessions.create();

    let again = sessions.open(Some(&id)).expect("known token");

    assert_eq!(again, id);
    assert_eq!(sessions.len(), 1);
}

#[test]
fn unknown_token_is_not_found() {
    let sessions = manager();

    let result = sessions.open(Some("never-issued"));

    assert!(matches!(result, Err(AppError::SessionNotFound(_))));
    assert!(sessions.is_empty());
}

#[test]
fn unknown_token_is_adopted_when_enabled() {
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(60), 8, true));

    let id = sessions.open(Some("client-chosen")).expect("adopted");

    assert_eq!(id, "client-chosen");
    assert_eq!(sessions.len(), 1);
}

#[test]
fn invalid_client_token_is_not_adopted() {
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(60), 8, true));

    let result = sessions.open(Some("has spaces"));

    assert!(matches!(result, Err(AppError::SessionNotFound(_))));
}

#[test]
fn removed_session_reports_expired_and_is_never_reused() {
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(60), 8, true));
    let id = sessions.create();

    sessions.remove(&id).expect("remove");

    assert!(matches!(sessions.touch(&id), Err(AppError::SessionExpired(_))));
    assert!(matches!(
        sessions.open(Some(&id)),
        Err(AppError::SessionExpired(_))
    ));
    assert!(matches!(sessions.remove(&id), Err(AppError::SessionExpired(_))));
}

#[test]
fn removal_returns_pending_ids() {
    let sessions = manager();
    let id = sessions.create();
    sessions.track(&id, RequestId::Number(7)).expect("track");
    sessions.track(&id, RequestId::Number(8)).expect("track");
    sessions.untrack(&id, &RequestId::Number(8));

    let removed = sessions.remove(&id).expect("remove");

    assert_eq!(removed.pending.len(), 1);
    assert!(removed.pending.contains(&RequestId::Number(7)));
    assert!(removed.stream.is_none());
}

#[test]
fn pending_request_makes_session_active() {
    let sessions = manager();
    let id = sessions.create();

    sessions.track(&id, RequestId::Number(1)).expect("track");

    assert_eq!(sessions.state_of(&id), Some(SessionState::Active));
    assert_eq!(sessions.pending_of(&id), Some(1));
}

#[tokio::test]
async fn idle_session_expires_on_touch() {
    let sessions = Arc::new(SessionManager::new(Duration::from_millis(20), 8, false));
    let id = sessions.create();

    tokio::time::sleep(Duration::from_millis(40)).await;

    assert!(matches!(sessions.touch(&id), Err(AppError::SessionExpired(_))));
    assert!(sessions.is_empty());
}

#[test]
fn expired_lists_only_idle_sessions_past_ceiling() {
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(10), 8, false));
    let idle = sessions.create();
    let busy = sessions.create();
    sessions.track(&busy, RequestId::Number(1)).expect("track");

    let later = Instant::now() + Duration::from_secs(11);
    let expired = sessions.expired(later);

    assert_eq!(expired, vec![idle]);
}

#[test]
fn expiry_is_rechecked_before_removal() {
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(10), 8, false));
    let resumed = sessions.create();
    let abandoned = sessions.create();
    let later = Instant::now() + Duration::from_secs(11);

    let listed = sessions.expired(later);
    assert_eq!(listed.len(), 2);

    // A request lands after the listing.
    sessions.track(&resumed, RequestId::Number(1)).expect("track");

    assert!(sessions.remove_if_expired(&resumed, later).is_none());
    assert_eq!(sessions.state_of(&resumed), Some(SessionState::Active));

    let removed = sessions.remove_if_expired(&abandoned, later).expect("still expired");
    assert!(removed.pending.is_empty());
    assert!(matches!(sessions.touch(&abandoned), Err(AppError::SessionExpired(_))));
    assert!(sessions.remove_if_expired(&abandoned, later).is_none());
}

#[tokio::test]
async fn attached_stream_receives_delivered_messages() {
    let sessions = manager();
    let id = sessions.create();
    let mut stream = sessions.attach_stream(&id).expect("attach");

    assert!(sessions.deliver(&id, note("one")));
    assert!(sessions.has_stream(&id));
    assert_eq!(sessions.state_of(&id), Some(SessionState::Active));

    assert_eq!(stream.recv().await, Some(note("one")));
    assert_eq!(stream.session_id(), id);
}

#[tokio::test]
async fn second_stream_replaces_first() {
    let sessions = manager();
    let id = sessions.create();
    let mut first = sessions.attach_stream(&id).expect("attach first");
    let mut second = sessions.attach_stream(&id).expect("attach second");

    assert_eq!(first.recv().await, None, "replaced stream ends");

    assert!(sessions.deliver(&id, note("after")));
    assert_eq!(second.recv().await, Some(note("after")));
}

#[tokio::test]
async fn dropping_replaced_stream_keeps_newer_attached() {
    let sessions = manager();
    let id = sessions.create();
    let first = sessions.attach_stream(&id).expect("attach first");
    let _second = sessions.attach_stream(&id).expect("attach second");

    drop(first);

    assert!(sessions.has_stream(&id));
}

#[tokio::test]
async fn dropping_stream_detaches_it() {
    let sessions = manager();
    let id = sessions.create();
    let stream = sessions.attach_stream(&id).expect("attach");

    drop(stream);

    assert!(!sessions.has_stream(&id));
    assert!(!sessions.deliver(&id, note("lost")));
}

#[tokio::test]
async fn broadcast_reaches_only_sessions_with_streams() {
    let sessions = manager();
    let listening = sessions.create();
    let silent = sessions.create();
    let mut stream = sessions.attach_stream(&listening).expect("attach");

    let delivered = sessions.broadcast(&note("hello"));

    assert_eq!(delivered, 1);
    assert_eq!(stream.recv().await, Some(note("hello")));
    assert!(!sessions.has_stream(&silent));
}

#[tokio::test]
async fn full_stream_drops_instead_of_blocking() {
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(60), 1, false));
    let id = sessions.create();
    let mut stream = sessions.attach_stream(&id).expect("attach");

    assert!(sessions.deliver(&id, note("kept")));
    assert!(!sessions.deliver(&id, note("dropped")));

    assert_eq!(stream.recv().await, Some(note("kept")));
    assert!(sessions.has_stream(&id), "a full buffer does not detach");
}

#[tokio::test]
async fn detach_all_ends_every_stream() {
    let sessions = manager();
    let a = sessions.create();
    let b = sessions.create();
    let mut sa = sessions.attach_stream(&a).expect("attach");
    let mut sb = sessions.attach_stream(&b).expect("attach");

    assert_eq!(sessions.detach_all(), 2);

    assert_eq!(sa.recv().await, None);
    assert_eq!(sb.recv().await, None);
}

#[test]
fn stream_on_unknown_session_fails() {
    let sessions = manager();
    assert!(matches!(
        sessions.attach_stream("missing"),
        Err(AppError::SessionNotFound(_))
    ));
}

#[test]
fn snapshot_reports_each_session() {
    let sessions = manager();
    let id = sessions.create();
    sessions.track(&id, RequestId::from("a")).expect("track");

    let snapshot = sessions.snapshot();

    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, id);
    assert_eq!(snapshot[0].pending, 1);
    assert!(!snapshot[0].has_stream);
    assert_eq!(snapshot[0].state, SessionState::Active);
}
