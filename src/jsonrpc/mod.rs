//! JSON-RPC message model and newline-delimited framing.

pub mod codec;
pub mod message;

pub use message::{ErrorObject, Message, Notification, Request, RequestId, Response, ResponsePayload};
