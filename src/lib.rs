#![forbid(unsafe_code)]

//! Streamable-HTTP bridge for stdio-only JSON-RPC servers.
//!
//! A single child process speaking newline-delimited JSON-RPC on its stdio
//! is shared by many HTTP clients. Each client works inside a session; the
//! bridge keeps request ids, progress tokens and notifications routed to the
//! session that owns them.

pub mod bridge;
pub mod config;
pub mod correlator;
pub mod errors;
pub mod jsonrpc;
pub mod process;
pub mod session;
pub mod transport;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use errors::{AppError, Result};
