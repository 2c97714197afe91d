//! Unit tests for request correlation against a recording child writer.
//!
//! Covers:
//! - wire id allocation and restoration of the client's id
//! - identical client ids in different sessions never cross
//! - duplicate ids within one session are rejected
//! - progress routing to the request's own channel or the session stream
//! - timeouts, cancellation on drop, crash flush, and write failure
//! - child-originated requests and their first-wins answers

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use mcp_stdio_bridge::correlator::{ChildWriter, Correlator, PendingEvent};
use mcp_stdio_bridge::jsonrpc::{
    ErrorObject, Message, Notification, Request, RequestId, Response, ResponsePayload,
};
use mcp_stdio_bridge::process::ChildListener;
use mcp_stdio_bridge::session::SessionManager;
use mcp_stdio_bridge::{AppError, Result};

#[derive(Default)]
struct RecordingWriter {
    sent: Mutex<Vec<Message>>,
    fail: AtomicBool,
}

impl RecordingWriter {
    fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    fn last_request_id(&self) -> RequestId {
        self.sent()
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::Request(r) => Some(r.id.clone()),
                _ => None,
            })
            .expect("a request was written")
    }
}

impl ChildWriter for RecordingWriter {
    fn send<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::ProcessUnavailable("child is down".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        })
    }
}

struct Fixture {
    sessions: Arc<SessionManager>,
    writer: Arc<RecordingWriter>,
    correlator: Arc<Correlator>,
}

fn fixture_with(timeout: Duration, cancel_method: Option<&str>) -> Fixture {
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(60), 16, false));
    let writer = Arc::new(RecordingWriter::default());
    let correlator = Arc::new(Correlator::new(
        Arc::clone(&sessions),
        Arc::clone(&writer) as Arc<dyn ChildWriter>,
        timeout,
        cancel_method.map(str::to_owned),
    ));
    Fixture {
        sessions,
        writer,
        correlator,
    }
}

fn fixture() -> Fixture {
    fixture_with(Duration::from_secs(30), Some("notifications/cancelled"))
}

fn request(id: impl Into<RequestId>, params: Option<Value>) -> Request {
    Request {
        id: id.into(),
        method: "tools/call".into(),
        params,
    }
}

fn reply(wire_id: RequestId, result: Value) -> Message {
    Message::Response(Response::result(wire_id, result))
}

/// Wait until the writer has recorded a message matching `pred`.
async fn wait_for_sent(writer: &RecordingWriter, pred: impl Fn(&Message) -> bool) -> Message {
    for _ in 0..100 {
        if let Some(m) = writer.sent().into_iter().find(|m| pred(m)) {
            return m;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected message was never written to the child");
}

fn is_cancel_for(message: &Message, wire_id: &RequestId) -> bool {
    matches!(message, Message::Notification(n) if n.cancelled_request_id().as_ref() == Some(wire_id))
}

#[tokio::test]
async fn response_restores_client_id() {
    let f = fixture();
    let session = f.sessions.create();

    let pending = f
        .correlator
        .submit(&session, request("client-1", None), false)
        .await
        .expect("submit");
    let wire_id = f.writer.last_request_id();
    assert!(matches!(wire_id, RequestId::Number(_)), "wire ids are integers");
    assert_eq!(f.sessions.pending_of(&session), Some(1));

    f.correlator.on_message(reply(wire_id, json!("pong")));
    let response = pending.response().await.expect("response");

    assert_eq!(response.id, RequestId::from("client-1"));
    assert_eq!(response.payload, ResponsePayload::Result(json!("pong")));
    assert_eq!(f.correlator.pending_count(), 0);
    assert_eq!(f.sessions.pending_of(&session), Some(0));
}

#[tokio::test]
async fn same_client_id_in_two_sessions_does_not_cross() {
    let f = fixture();
    let a = f.sessions.create();
    let b = f.sessions.create();

    let pending_a = f.correlator.submit(&a, request(1, None), false).await.expect("a");
    let wire_a = f.writer.last_request_id();
    let pending_b = f.correlator.submit(&b, request(1, None), false).await.expect("b");
    let wire_b = f.writer.last_request_id();
    assert_ne!(wire_a, wire_b);

    // Answer in reverse order.
    f.correlator.on_message(reply(wire_b, json!("for-b")));
    f.correlator.on_message(reply(wire_a, json!("for-a")));

    let ra = pending_a.response().await.expect("a response");
    let rb = pending_b.response().await.expect("b response");
    assert_eq!(ra.payload, ResponsePayload::Result(json!("for-a")));
    assert_eq!(rb.payload, ResponsePayload::Result(json!("for-b")));
    assert_eq!(ra.id, RequestId::Number(1));
    assert_eq!(rb.id, RequestId::Number(1));
}

#[tokio::test]
async fn duplicate_id_in_one_session_is_rejected() {
    let f = fixture();
    let session = f.sessions.create();
    let _first = f
        .correlator
        .submit(&session, request(5, None), false)
        .await
        .expect("first");

    let second = f.correlator.submit(&session, request(5, None), false).await;

    assert!(matches!(second, Err(AppError::DuplicateRequestId(_))));
    assert_eq!(f.correlator.pending_count(), 1);
}

#[tokio::test]
async fn submit_on_unknown_session_fails() {
    let f = fixture();

    let result = f.correlator.submit("nope", request(1, None), false).await;

    assert!(matches!(result, Err(AppError::SessionNotFound(_))));
    assert!(f.writer.sent().is_empty());
}

#[tokio::test]
async fn progress_goes_to_request_channel_with_client_token() {
    let f = fixture();
    let session = f.sessions.create();
    let params = json!({"name": "slow", "_meta": {"progressToken": "tok-1"}});

    let mut pending = f
        .correlator
        .submit(&session, request(1, Some(params)), true)
        .await
        .expect("submit");
    let sent = f.writer.sent();
    let Message::Request(forwarded) = &sent[0] else {
        panic!("expected a request");
    };
    let wire_token = forwarded.progress_token().cloned().expect("token kept");
    assert_eq!(wire_token, forwarded.id.to_value(), "token rewritten to wire id");

    f.correlator.on_message(Message::Notification(Notification::new(
        "notifications/progress",
        Some(json!({"progressToken": wire_token, "progress": 1, "total": 2})),
    )));
    f.correlator
        .on_message(reply(forwarded.id.clone(), json!({"done": true})));

    let PendingEvent::Related(Message::Notification(progress)) = pending.next_event().await else {
        panic!("expected progress before the response");
    };
    assert_eq!(progress.progress_token(), Some(&json!("tok-1")));

    let PendingEvent::Done(outcome) = pending.next_event().await else {
        panic!("expected the final response");
    };
    assert_eq!(outcome.expect("ok").id, RequestId::Number(1));
}

#[tokio::test]
async fn progress_without_request_channel_goes_to_session_stream() {
    let f = fixture();
    let session = f.sessions.create();
    let other = f.sessions.create();
    let mut stream = f.sessions.attach_stream(&session).expect("attach");
    let mut other_stream = f.sessions.attach_stream(&other).expect("attach");
    let params = json!({"_meta": {"progressToken": 99}});

    let _pending = f
        .correlator
        .submit(&session, request(1, Some(params)), false)
        .await
        .expect("submit");
    let wire_id = f.writer.last_request_id();

    f.correlator.on_message(Message::Notification(Notification::new(
        "notifications/progress",
        Some(json!({"progressToken": wire_id.to_value(), "progress": 1})),
    )));

    let Some(Message::Notification(progress)) = stream.recv().await else {
        panic!("expected progress on the session stream");
    };
    assert_eq!(progress.progress_token(), Some(&json!(99)));

    f.sessions.deliver(&other, Message::Notification(Notification::new("marker", None)));
    let Some(Message::Notification(first_for_other)) = other_stream.recv().await else {
        panic!("expected marker");
    };
    assert_eq!(first_for_other.method, "marker", "progress never reached the other session");
}

#[tokio::test]
async fn notification_without_hint_is_broadcast() {
    let f = fixture();
    let a = f.sessions.create();
    let b = f.sessions.create();
    let _silent = f.sessions.create();
    let mut sa = f.sessions.attach_stream(&a).expect("attach");
    let mut sb = f.sessions.attach_stream(&b).expect("attach");
    let message = Message::Notification(Notification::new(
        "notifications/tools/list_changed",
        None,
    ));

    f.correlator.on_message(message.clone());

    assert_eq!(sa.recv().await, Some(message.clone()));
    assert_eq!(sb.recv().await, Some(message));
}

#[tokio::test]
async fn broadcast_preserves_emission_order() {
    let f = fixture();
    let a = f.sessions.create();
    let mut stream = f.sessions.attach_stream(&a).expect("attach");

    for n in 0..5 {
        f.correlator.on_message(Message::Notification(Notification::new(
            "notifications/message",
            Some(json!({"n": n})),
        )));
    }

    for n in 0..5 {
        let Some(Message::Notification(note)) = stream.recv().await else {
            panic!("expected notification {n}");
        };
        assert_eq!(note.params, Some(json!({"n": n})));
    }
}

#[tokio::test]
async fn sweep_times_out_and_notifies_child() {
    let f = fixture_with(Duration::from_secs(5), Some("notifications/cancelled"));
    let session = f.sessions.create();
    let pending = f
        .correlator
        .submit(&session, request("slow", None), false)
        .await
        .expect("submit");
    let wire_id = f.writer.last_request_id();

    assert_eq!(f.correlator.sweep_expired(Instant::now()), 0);
    let expired = f
        .correlator
        .sweep_expired(Instant::now() + Duration::from_secs(10));

    assert_eq!(expired, 1);
    assert!(matches!(pending.response().await, Err(AppError::RequestTimeout(_))));
    assert_eq!(f.sessions.pending_of(&session), Some(0));
    wait_for_sent(&f.writer, |m| is_cancel_for(m, &wire_id)).await;

    // A late answer is discarded.
    f.correlator.on_message(reply(wire_id, json!("late")));
    assert_eq!(f.correlator.pending_count(), 0);
}

#[tokio::test]
async fn unbounded_timeout_is_clamped() {
    let f = fixture_with(Duration::MAX, Some("notifications/cancelled"));
    let session = f.sessions.create();
    let pending = f
        .correlator
        .submit(&session, request(1, None), false)
        .await
        .expect("submit with huge timeout");

    let a_year = Instant::now() + Duration::from_secs(365 * 24 * 60 * 60);
    assert_eq!(f.correlator.sweep_expired(a_year), 1);
    assert!(matches!(pending.response().await, Err(AppError::RequestTimeout(_))));
}

#[tokio::test]
async fn dropping_handle_cancels_request() {
    let f = fixture();
    let session = f.sessions.create();
    let pending = f
        .correlator
        .submit(&session, request(3, None), false)
        .await
        .expect("submit");
    let wire_id = f.writer.last_request_id();

    drop(pending);

    assert_eq!(f.correlator.pending_count(), 0);
    assert_eq!(f.sessions.pending_of(&session), Some(0));
    let notice = wait_for_sent(&f.writer, |m| is_cancel_for(m, &wire_id)).await;
    let Message::Notification(notice) = notice else {
        panic!("expected notification");
    };
    assert_eq!(notice.method, "notifications/cancelled");
    assert!(notice.params.as_ref().and_then(|p| p.get("reason")).is_some());
}

#[tokio::test]
async fn cancel_notice_is_skipped_when_disabled() {
    let f = fixture_with(Duration::from_secs(30), None);
    let session = f.sessions.create();
    let pending = f
        .correlator
        .submit(&session, request(3, None), false)
        .await
        .expect("submit");

    drop(pending);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(f.writer.sent().len(), 1, "only the original request was written");
}

#[tokio::test]
async fn child_exit_fails_every_pending_request() {
    let f = fixture();
    let a = f.sessions.create();
    let b = f.sessions.create();
    let pa = f.correlator.submit(&a, request(1, None), false).await.expect("a");
    let pb = f.correlator.submit(&b, request(1, None), false).await.expect("b");

    f.correlator.on_exit("child 42 stdout closed; exited with code 1");

    assert!(matches!(pa.response().await, Err(AppError::ProcessCrashed(_))));
    assert!(matches!(pb.response().await, Err(AppError::ProcessCrashed(_))));
    assert_eq!(f.correlator.pending_count(), 0);
    assert_eq!(f.sessions.pending_of(&a), Some(0));
}

#[tokio::test]
async fn failed_write_unregisters_request() {
    let f = fixture();
    let session = f.sessions.create();
    f.writer.fail.store(true, Ordering::SeqCst);

    let result = f.correlator.submit(&session, request(1, None), false).await;

    assert!(matches!(result, Err(AppError::ProcessUnavailable(_))));
    assert_eq!(f.correlator.pending_count(), 0);
    assert_eq!(f.sessions.pending_of(&session), Some(0));

    // The id is free again.
    f.writer.fail.store(false, Ordering::SeqCst);
    assert!(f.correlator.submit(&session, request(1, None), false).await.is_ok());
}

#[tokio::test]
async fn child_cancellation_resolves_request() {
    let f = fixture();
    let session = f.sessions.create();
    let mut stream = f.sessions.attach_stream(&session).expect("attach");
    let pending = f
        .correlator
        .submit(&session, request("c-1", None), false)
        .await
        .expect("submit");
    let wire_id = f.writer.last_request_id();

    f.correlator.on_message(Message::Notification(Notification::new(
        "notifications/cancelled",
        Some(json!({"requestId": wire_id.to_value(), "reason": "server busy"})),
    )));

    assert!(matches!(pending.response().await, Err(AppError::Cancelled(_))));
    let Some(Message::Notification(note)) = stream.recv().await else {
        panic!("expected the cancellation on the owner's stream");
    };
    assert_eq!(note.cancelled_request_id(), Some(RequestId::from("c-1")));
}

#[tokio::test]
async fn client_cancellation_is_rewritten_to_wire_id() {
    let f = fixture();
    let session = f.sessions.create();
    let pending = f
        .correlator
        .submit(&session, request(11, None), false)
        .await
        .expect("submit");
    let wire_id = f.writer.last_request_id();

    f.correlator
        .forward(
            &session,
            Message::Notification(Notification::new(
                "notifications/cancelled",
                Some(json!({"requestId": 11, "reason": "user abort"})),
            )),
        )
        .await
        .expect("forward");

    assert!(matches!(pending.response().await, Err(AppError::Cancelled(_))));
    let forwarded = f.writer.sent().pop().expect("forwarded");
    assert!(is_cancel_for(&forwarded, &wire_id));
}

#[tokio::test]
async fn child_request_is_broadcast_and_first_answer_wins() {
    let f = fixture();
    let a = f.sessions.create();
    let b = f.sessions.create();
    let mut sa = f.sessions.attach_stream(&a).expect("attach");
    let mut sb = f.sessions.attach_stream(&b).expect("attach");
    let ping = Message::Request(Request {
        id: RequestId::from("srv-1"),
        method: "ping".into(),
        params: None,
    });

    f.correlator.on_message(ping.clone());
    assert_eq!(sa.recv().await, Some(ping.clone()));
    assert_eq!(sb.recv().await, Some(ping));
    assert_eq!(f.correlator.outbound_count(), 1);

    let answer = Message::Response(Response::result(RequestId::from("srv-1"), json!({})));
    f.correlator.forward(&a, answer.clone()).await.expect("first");
    f.correlator.forward(&b, answer.clone()).await.expect("second is dropped");

    let answers = f.writer.sent().into_iter().filter(|m| *m == answer).count();
    assert_eq!(answers, 1);
    assert_eq!(f.correlator.outbound_count(), 0);
}

#[tokio::test]
async fn child_request_without_streams_is_answered_with_error() {
    let f = fixture();
    let _session = f.sessions.create();

    f.correlator.on_message(Message::Request(Request {
        id: RequestId::Number(900),
        method: "sampling/createMessage".into(),
        params: None,
    }));

    let answer = wait_for_sent(&f.writer, |m| {
        matches!(m, Message::Response(r) if r.id == RequestId::Number(900))
    })
    .await;
    let Message::Response(Response {
        payload: ResponsePayload::Error(ErrorObject { code, .. }),
        ..
    }) = answer
    else {
        panic!("expected an error response");
    };
    assert_eq!(code, -32603);
    assert_eq!(f.correlator.outbound_count(), 0);
}

#[tokio::test]
async fn forwarding_a_request_is_rejected() {
    let f = fixture();
    let session = f.sessions.create();

    let result = f
        .correlator
        .forward(&session, Message::Request(request(1, None)))
        .await;

    assert!(matches!(result, Err(AppError::MalformedMessage(_))));
}

#[tokio::test]
async fn unknown_response_is_dropped() {
    let f = fixture();

    f.correlator.on_message(reply(RequestId::Number(12345), json!(null)));

    assert_eq!(f.correlator.pending_count(), 0);
}

#[tokio::test]
async fn cancel_session_cancels_its_requests_only() {
    let f = fixture();
    let a = f.sessions.create();
    let b = f.sessions.create();
    let pa = f.correlator.submit(&a, request(1, None), false).await.expect("a");
    let _pb = f.correlator.submit(&b, request(1, None), false).await.expect("b");

    let removed = f.sessions.remove(&a).expect("remove");
    let cancelled = f.correlator.cancel_session(&removed.pending, "session terminated");

    assert_eq!(cancelled, 1);
    assert!(matches!(pa.response().await, Err(AppError::Cancelled(_))));
    assert_eq!(f.correlator.pending_count(), 1);
}
