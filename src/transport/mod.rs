//! Streamable-HTTP surface.
//!
//! One endpoint, `/mcp`, carries every client interaction:
//!
//! - `POST` sends one JSON-RPC message; requests are answered with JSON or,
//!   when related notifications arrive first, with an event stream.
//! - `GET` opens the session's server-to-client event stream.
//! - `DELETE` terminates the session.
//!
//! `/health` reports process and session status.

pub mod handlers;
pub mod http;

/// Header carrying the session token in both directions.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Path of the protocol endpoint.
pub const MCP_PATH: &str = "/mcp";

/// Path of the status endpoint.
pub const HEALTH_PATH: &str = "/health";
