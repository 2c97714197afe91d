//! JSON-RPC message model.
//!
//! [`Message`] is the sum of the three JSON-RPC shapes the bridge moves
//! between the child process and HTTP clients. Classification happens once,
//! at decode time, so every later stage matches exhaustively on the variant
//! instead of probing fields.
//!
//! The wire form always carries `"jsonrpc":"2.0"`. Inbound messages that omit
//! the version field are accepted; a present but different version is
//! rejected. Batches (JSON arrays) are not supported.

use std::fmt::{Display, Formatter};

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// Protocol version string written on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method name of progress notifications.
pub const PROGRESS_METHOD: &str = "notifications/progress";

/// Method name of cancellation notifications.
pub const CANCELLED_METHOD: &str = "notifications/cancelled";

// ── Identifiers ───────────────────────────────────────────────────────────────

/// A JSON-RPC request identifier: an integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer identifier.
    Number(i64),
    /// String identifier.
    String(String),
}

impl RequestId {
    /// Convert an arbitrary JSON value into an id, if it has an id shape.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }

    /// JSON representation of this id.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::from(s.as_str()),
        }
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

// ── Message shapes ────────────────────────────────────────────────────────────

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Short human-readable description.
    pub message: String,
    /// Optional structured detail.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Build an error object without detail.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<&AppError> for ErrorObject {
    fn from(err: &AppError) -> Self {
        Self::new(err.rpc_code(), err.to_string())
    }
}

/// A call expecting exactly one [`Response`] with the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Caller-assigned identifier.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Method parameters, if any.
    pub params: Option<Value>,
}

/// Outcome carried by a [`Response`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Successful result (may be `null`).
    Result(Value),
    /// Failure.
    Error(ErrorObject),
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Identifier of the request being answered.
    pub id: RequestId,
    /// Result or error.
    pub payload: ResponsePayload,
}

impl Response {
    /// Build a successful response.
    #[must_use]
    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            id,
            payload: ResponsePayload::Result(result),
        }
    }

    /// Build an error response.
    #[must_use]
    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    /// Whether this response carries an error object.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }
}

/// A one-way message with no id.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Method parameters, if any.
    pub params: Option<Value>,
}

impl Notification {
    /// Build a notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// `params.progressToken` of a progress notification.
    #[must_use]
    pub fn progress_token(&self) -> Option<&Value> {
        if self.method != PROGRESS_METHOD {
            return None;
        }
        self.params.as_ref()?.get("progressToken")
    }

    /// Replace `params.progressToken` of a progress notification.
    pub fn set_progress_token(&mut self, token: Value) {
        if let Some(Value::Object(params)) = self.params.as_mut() {
            params.insert("progressToken".to_owned(), token);
        }
    }

    /// `params.requestId` of a cancellation notification.
    #[must_use]
    pub fn cancelled_request_id(&self) -> Option<RequestId> {
        if self.method != CANCELLED_METHOD {
            return None;
        }
        RequestId::from_value(self.params.as_ref()?.get("requestId")?)
    }

    /// Replace `params.requestId` of a cancellation notification.
    pub fn set_cancelled_request_id(&mut self, id: &RequestId) {
        if let Some(Value::Object(params)) = self.params.as_mut() {
            params.insert("requestId".to_owned(), id.to_value());
        }
    }
}

impl Request {
    /// `params._meta.progressToken`, if the caller asked for progress.
    #[must_use]
    pub fn progress_token(&self) -> Option<&Value> {
        self.params.as_ref()?.get("_meta")?.get("progressToken")
    }

    /// Replace `params._meta.progressToken`; no-op if the request has none.
    pub fn set_progress_token(&mut self, token: Value) {
        let slot = self
            .params
            .as_mut()
            .and_then(|p| p.get_mut("_meta"))
            .and_then(|m| m.get_mut("progressToken"));
        if let Some(slot) = slot {
            *slot = token;
        }
    }
}

/// Any JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call expecting a response.
    Request(Request),
    /// The answer to a call.
    Response(Response),
    /// A one-way message.
    Notification(Notification),
}

impl Message {
    /// Identifier of requests and responses; `None` for notifications.
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Notification(_) => None,
        }
    }

    /// Method name of requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// Short label used in log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Notification(_) => "notification",
        }
    }

    /// Parse a message from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::MalformedMessage`] if the bytes are not JSON or
    /// the JSON is not a single JSON-RPC message.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| AppError::MalformedMessage(format!("invalid json: {e}")))?;
        Self::try_from(value)
    }

    /// Serialize to compact single-line JSON.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::MalformedMessage`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| AppError::MalformedMessage(format!("failed to serialise message: {e}")))
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Self::Request(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Self::Response(value)
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Self::Notification(value)
    }
}

// ── Wire encoding ─────────────────────────────────────────────────────────────

/// Field-level view of a JSON-RPC object before classification.
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

/// Keep an explicit `null` as `Some(Value::Null)` so `"result": null` is
/// distinguishable from an absent field.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<Value> for Message {
    type Error = AppError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(_) => {}
            Value::Array(_) => {
                return Err(AppError::MalformedMessage(
                    "batch messages are not supported".into(),
                ))
            }
            _ => {
                return Err(AppError::MalformedMessage(
                    "message must be a json object".into(),
                ))
            }
        }

        let raw = RawMessage::deserialize(value)
            .map_err(|e| AppError::MalformedMessage(format!("invalid field: {e}")))?;
        Self::try_from(raw)
    }
}

impl TryFrom<RawMessage> for Message {
    type Error = AppError;

    fn try_from(raw: RawMessage) -> Result<Self> {
        if let Some(version) = raw.jsonrpc.as_deref() {
            if version != JSONRPC_VERSION {
                return Err(AppError::MalformedMessage(format!(
                    "unsupported jsonrpc version: {version}"
                )));
            }
        }

        match (raw.method, raw.id, raw.result, raw.error) {
            (Some(method), Some(id), None, None) => Ok(Self::Request(Request {
                id,
                method,
                params: raw.params,
            })),
            (Some(method), None, None, None) => Ok(Self::Notification(Notification {
                method,
                params: raw.params,
            })),
            (Some(_), _, _, _) => Err(AppError::MalformedMessage(
                "message carries both method and result/error".into(),
            )),
            (None, Some(id), Some(result), None) => Ok(Self::Response(Response::result(id, result))),
            (None, Some(id), None, Some(error)) => Ok(Self::Response(Response::error(id, error))),
            (None, None, Some(_), _) | (None, None, _, Some(_)) => Err(
                AppError::MalformedMessage("response without id".into()),
            ),
            (None, Some(_), Some(_), Some(_)) => Err(AppError::MalformedMessage(
                "response carries both result and error".into(),
            )),
            (None, _, _, _) => Err(AppError::MalformedMessage(
                "message has neither method nor result/error".into(),
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::try_from(value).map_err(D::Error::custom)
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match self {
            Self::Request(req) => {
                map.serialize_entry("id", &req.id)?;
                map.serialize_entry("method", &req.method)?;
                if let Some(params) = &req.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Self::Response(resp) => {
                map.serialize_entry("id", &resp.id)?;
                match &resp.payload {
                    ResponsePayload::Result(result) => map.serialize_entry("result", result)?,
                    ResponsePayload::Error(error) => map.serialize_entry("error", error)?,
                }
            }
            Self::Notification(note) => {
                map.serialize_entry("method", &note.method)?;
                if let Some(params) = &note.params {
                    map.serialize_entry("params", params)?;
                }
            }
        }
        map.end()
    }
}

/// Build `params` for a cancellation notification.
#[must_use]
pub fn cancellation_params(id: &RequestId, reason: &str) -> Value {
    let mut params = Map::new();
    params.insert("requestId".to_owned(), id.to_value());
    params.insert("reason".to_owned(), Value::from(reason));
    Value::Object(params)
}
