//! Router assembly and the HTTP server loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::handlers::{delete_session, get_stream, health, post_message};
use super::{HEALTH_PATH, MCP_PATH};
use crate::bridge::Bridge;
use crate::{AppError, Result};

/// Build the axum router for `bridge`.
pub fn router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route(
            MCP_PATH,
            get(get_stream).post(post_message).delete(delete_session),
        )
        .route(HEALTH_PATH, get(health))
        .with_state(bridge)
}

/// Bind the listener the transport will serve on.
///
/// # Errors
///
/// Returns `AppError::Transport` if the address cannot be bound.
pub async fn bind_http(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Transport(format!("failed to bind {addr}: {err}")))
}

/// Serve the transport on `listener` until `ct` is cancelled.
///
/// On cancellation the bridge is drained first, so waiting requests and
/// open event streams end and the connections can close.
///
/// # Errors
///
/// Returns `AppError::Transport` if the server fails.
pub async fn serve_http(
    bridge: Arc<Bridge>,
    listener: TcpListener,
    ct: CancellationToken,
) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|err| AppError::Transport(format!("listener has no local address: {err}")))?;
    info!(%local, "starting streamable HTTP transport");

    let draining = Arc::clone(&bridge);
    axum::serve(listener, router(bridge))
        .with_graceful_shutdown(async move {
            ct.cancelled().await;
            draining.drain();
        })
        .await
        .map_err(|err| AppError::Transport(format!("HTTP server error: {err}")))?;

    info!("streamable HTTP transport shut down");
    Ok(())
}
