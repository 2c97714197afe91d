//! Request handlers for `/mcp` and `/health`.
//!
//! | Error                                   | HTTP | JSON-RPC code |
//! |-----------------------------------------|------|---------------|
//! | body is not JSON                        | 400  | -32700        |
//! | body is not one JSON-RPC message        | 400  | -32600        |
//! | duplicate request id                    | 400  | -32600        |
//! | unknown, terminated or expired session  | 404  | -32001        |
//! | child process not running               | 503  | -32002        |
//! | crash, timeout or cancellation          | 200  | error object  |

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream;
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tracing::{debug, info_span, warn, Instrument};

use super::SESSION_HEADER;
use crate::bridge::Bridge;
use crate::correlator::{PendingEvent, PendingResponse};
use crate::errors::{INVALID_REQUEST, PARSE_ERROR};
use crate::jsonrpc::message::JSONRPC_VERSION;
use crate::jsonrpc::{ErrorObject, Message, Request, RequestId, Response as RpcResponse};
use crate::{AppError, Result};

/// `POST /mcp`: accept one JSON-RPC message from a client.
pub async fn post_message(
    State(bridge): State<Arc<Bridge>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message = match decode_body(&body) {
        Ok(message) => message,
        Err(rejection) => return rejection,
    };

    let token = session_token(&headers);
    let session_id = match bridge.open_session(token.as_deref()) {
        Ok(id) => id,
        Err(err) => return error_response(&err, message.id(), token.as_deref()),
    };

    let span = info_span!("post", session_id = %session_id, kind = message.kind());
    let response = async {
        match message {
            Message::Request(request) => {
                let stream_related = accepts_event_stream(&headers);
                submit_request(&bridge, &session_id, request, stream_related).await
            }
            other => match bridge.forward(&session_id, other).await {
                Ok(()) => StatusCode::ACCEPTED.into_response(),
                Err(err) => error_response(&err, None, Some(&session_id)),
            },
        }
    }
    .instrument(span)
    .await;

    with_session(response, &session_id)
}

/// `GET /mcp`: open the session's event stream.
pub async fn get_stream(State(bridge): State<Arc<Bridge>>, headers: HeaderMap) -> Response {
    let Some(token) = session_token(&headers) else {
        return missing_session_header();
    };

    let events = match bridge.open_stream(&token) {
        Ok(events) => events,
        Err(err) => return error_response(&err, None, Some(&token)),
    };

    debug!(session_id = %token, "event stream opened");
    let body = events.map(|message| Ok::<Event, Infallible>(to_event(&message)));
    let sse = Sse::new(body).keep_alive(KeepAlive::default());
    with_session(sse.into_response(), &token)
}

/// `DELETE /mcp`: terminate the session.
pub async fn delete_session(State(bridge): State<Arc<Bridge>>, headers: HeaderMap) -> Response {
    let Some(token) = session_token(&headers) else {
        return missing_session_header();
    };

    match bridge.close_session(&token, "terminated by client") {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err, None, Some(&token)),
    }
}

/// `GET /health`: process and session status.
pub async fn health(State(bridge): State<Arc<Bridge>>) -> Response {
    Json(bridge.health()).into_response()
}

async fn submit_request(
    bridge: &Bridge,
    session_id: &str,
    request: Request,
    stream_related: bool,
) -> Response {
    let client_id = request.id.clone();
    let mut pending = match bridge.submit(session_id, request, stream_related).await {
        Ok(pending) => pending,
        Err(err) => return error_response(&err, Some(&client_id), Some(session_id)),
    };

    match pending.next_event().await {
        PendingEvent::Done(outcome) => json_outcome(&client_id, outcome),
        PendingEvent::Related(first) => {
            debug!(request_id = %client_id, "upgrading response to an event stream");
            Sse::new(request_events(first, pending))
                .keep_alive(KeepAlive::default())
                .into_response()
        }
    }
}

enum PostStream {
    First(Message, PendingResponse),
    Waiting(PendingResponse),
    Finished,
}

/// Related notifications followed by the final response.
fn request_events(
    first: Message,
    pending: PendingResponse,
) -> impl futures_util::Stream<Item = std::result::Result<Event, Infallible>> + Send {
    stream::unfold(PostStream::First(first, pending), |state| async move {
        match state {
            PostStream::First(message, pending) => {
                Some((Ok(to_event(&message)), PostStream::Waiting(pending)))
            }
            PostStream::Waiting(mut pending) => match pending.next_event().await {
                PendingEvent::Related(message) => {
                    Some((Ok(to_event(&message)), PostStream::Waiting(pending)))
                }
                PendingEvent::Done(outcome) => {
                    let client_id = pending.client_id().clone();
                    let message = outcome_message(&client_id, outcome);
                    Some((Ok(to_event(&message)), PostStream::Finished))
                }
            },
            PostStream::Finished => None,
        }
    })
}

fn decode_body(body: &[u8]) -> std::result::Result<Message, Response> {
    let value: Value = serde_json::from_slice(body).map_err(|err| {
        rpc_error_response(
            StatusCode::BAD_REQUEST,
            None,
            &ErrorObject::new(PARSE_ERROR, format!("parse error: {err}")),
        )
    })?;

    Message::try_from(value).map_err(|err| {
        rpc_error_response(
            StatusCode::BAD_REQUEST,
            None,
            &ErrorObject::new(INVALID_REQUEST, err.to_string()),
        )
    })
}

fn json_outcome(client_id: &RequestId, outcome: Result<RpcResponse>) -> Response {
    let status = match &outcome {
        Ok(_) => StatusCode::OK,
        Err(err) => status_for(err),
    };
    let message = outcome_message(client_id, outcome);
    match message.to_json() {
        Ok(body) => (status, [(CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => {
            warn!(%err, "failed to encode response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Final message for a request: the response, or an error object with the
/// client's id.
fn outcome_message(client_id: &RequestId, outcome: Result<RpcResponse>) -> Message {
    match outcome {
        Ok(response) => Message::Response(response),
        Err(err) => Message::Response(RpcResponse::error(
            client_id.clone(),
            ErrorObject::from(&err),
        )),
    }
}

fn to_event(message: &Message) -> Event {
    match message.to_json() {
        Ok(data) => Event::default().event("message").data(data),
        Err(err) => {
            warn!(%err, kind = message.kind(), "failed to encode event");
            Event::default().comment("encoding error")
        }
    }
}

/// HTTP status for an error surfaced to a client.
#[must_use]
pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::MalformedMessage(_)
        | AppError::FrameTooLarge(_)
        | AppError::DuplicateRequestId(_) => StatusCode::BAD_REQUEST,
        AppError::SessionNotFound(_) | AppError::SessionExpired(_) => StatusCode::NOT_FOUND,
        AppError::ProcessUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::ProcessCrashed(_) | AppError::RequestTimeout(_) | AppError::Cancelled(_) => {
            StatusCode::OK
        }
        AppError::Config(_) | AppError::Io(_) | AppError::Transport(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: &AppError, id: Option<&RequestId>, session_id: Option<&str>) -> Response {
    let code = match err {
        AppError::DuplicateRequestId(_) | AppError::MalformedMessage(_) => INVALID_REQUEST,
        other => other.rpc_code(),
    };
    let response = rpc_error_response(status_for(err), id, &ErrorObject::new(code, err.to_string()));
    match session_id {
        Some(session_id) if !matches!(err, AppError::SessionNotFound(_) | AppError::SessionExpired(_)) => {
            with_session(response, session_id)
        }
        _ => response,
    }
}

fn rpc_error_response(status: StatusCode, id: Option<&RequestId>, error: &ErrorObject) -> Response {
    let body = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.map_or(Value::Null, RequestId::to_value),
        "error": error,
    });
    (status, Json(body)).into_response()
}

fn missing_session_header() -> Response {
    rpc_error_response(
        StatusCode::BAD_REQUEST,
        None,
        &ErrorObject::new(INVALID_REQUEST, format!("missing {SESSION_HEADER} header")),
    )
}

fn with_session(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("text/event-stream"))
}
