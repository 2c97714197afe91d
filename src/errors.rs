//! Error types shared across the bridge.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// JSON-RPC code for an unparsable request body.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC code for a well-formed body that is not a valid message.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC code for internal bridge failures.
pub const INTERNAL_ERROR: i64 = -32603;
/// Server-defined code: the referenced session does not exist or has ended.
pub const SESSION_ERROR: i64 = -32001;
/// Server-defined code: the child process is not running.
pub const PROCESS_UNAVAILABLE: i64 = -32002;
/// Server-defined code: the child process exited while the request was pending.
pub const PROCESS_CRASHED: i64 = -32003;
/// Server-defined code: the request deadline elapsed.
pub const REQUEST_TIMEOUT: i64 = -32004;
/// Code used for requests cancelled before a response arrived.
pub const REQUEST_CANCELLED: i64 = -32800;

/// Application error enumeration covering all bridge failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system, pipe, or socket I/O failure.
    Io(String),
    /// A line or body that is not a well-formed JSON-RPC message.
    MalformedMessage(String),
    /// A request id already pending within the same session.
    DuplicateRequestId(String),
    /// The child process is not in the `Running` state.
    ProcessUnavailable(String),
    /// The child process exited while the request was outstanding.
    ProcessCrashed(String),
    /// The request deadline elapsed before a response arrived.
    RequestTimeout(String),
    /// The referenced session was never issued.
    SessionNotFound(String),
    /// The referenced session was terminated or expired.
    SessionExpired(String),
    /// An inbound line exceeded the framing ceiling.
    FrameTooLarge(String),
    /// The request was cancelled before it resolved.
    Cancelled(String),
    /// HTTP listener or server failure.
    Transport(String),
}

impl AppError {
    /// JSON-RPC error code reported to clients for this error.
    #[must_use]
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::MalformedMessage(_) | Self::FrameTooLarge(_) => PARSE_ERROR,
            Self::DuplicateRequestId(_) => INVALID_REQUEST,
            Self::SessionNotFound(_) | Self::SessionExpired(_) => SESSION_ERROR,
            Self::ProcessUnavailable(_) => PROCESS_UNAVAILABLE,
            Self::ProcessCrashed(_) => PROCESS_CRASHED,
            Self::RequestTimeout(_) => REQUEST_TIMEOUT,
            Self::Cancelled(_) => REQUEST_CANCELLED,
            Self::Config(_) | Self::Io(_) | Self::Transport(_) => INTERNAL_ERROR,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::MalformedMessage(msg) => write!(f, "malformed message: {msg}"),
            Self::DuplicateRequestId(msg) => write!(f, "duplicate request id: {msg}"),
            Self::ProcessUnavailable(msg) => write!(f, "process unavailable: {msg}"),
            Self::ProcessCrashed(msg) => write!(f, "process crashed: {msg}"),
            Self::RequestTimeout(msg) => write!(f, "request timeout: {msg}"),
            Self::SessionNotFound(msg) => write!(f, "session not found: {msg}"),
            Self::SessionExpired(msg) => write!(f, "session expired: {msg}"),
            Self::FrameTooLarge(msg) => write!(f, "frame too large: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
