#![forbid(unsafe_code)]

//! `mcp-stdio-bridge`: serve a stdio JSON-RPC server over streamable HTTP.
//!
//! Loads configuration, launches the child process, and serves `/mcp` until
//! ctrl-c or `SIGTERM`. The child is stopped on every exit path.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use mcp_stdio_bridge::transport::http::{bind_http, serve_http};
use mcp_stdio_bridge::{AppError, Bridge, BridgeConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "mcp-stdio-bridge",
    about = "Expose a stdio JSON-RPC server over streamable HTTP",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on; overrides the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Child command and its arguments; overrides `process.command`.
    #[arg(last = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = load_config(args)?;
    info!(listen = %config.listen, command = %config.process.command, "configuration loaded");

    let listener = bind_http(config.listen).await?;
    let bridge = Arc::new(Bridge::new(config));

    if let Err(err) = bridge.start().await {
        error!(%err, "failed to start child process");
        bridge.shutdown().await;
        return Err(err);
    }

    let ct = CancellationToken::new();
    let sweeper = bridge.spawn_sweeper(ct.clone());

    let server_ct = ct.clone();
    let server_bridge = Arc::clone(&bridge);
    let mut server = tokio::spawn(async move {
        let outcome = serve_http(server_bridge, listener, server_ct.clone()).await;
        server_ct.cancel();
        outcome
    });

    info!("bridge ready");

    let served = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            ct.cancel();
            server.await
        }
        joined = &mut server => {
            error!("HTTP server stopped unexpectedly");
            joined
        }
    };
    ct.cancel();

    let outcome = match served {
        Ok(outcome) => outcome,
        Err(err) => Err(AppError::Transport(format!("server task failed: {err}"))),
    };
    if let Err(err) = &outcome {
        error!(%err, "HTTP transport failed");
    }

    if let Err(err) = sweeper.await {
        error!(%err, "sweeper task failed");
    }
    bridge.shutdown().await;
    info!("mcp-stdio-bridge shut down");

    outcome
}

fn load_config(args: Cli) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load_from_path(path)?,
        None => BridgeConfig::default(),
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let mut command = args.command.into_iter();
    if let Some(program) = command.next() {
        config.process.command = program;
        config.process.args = command.collect();
    }

    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
