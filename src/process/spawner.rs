//! Child process spawner.
//!
//! Launches the proxied server with all three stdio streams piped and
//! `kill_on_drop(true)` so the process never outlives its handle. The child
//! inherits the bridge's environment unless `inherit_env = false`, in which
//! case everything except [`ALLOWED_ENV_VARS`] and the configured `env` is
//! stripped.

use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::info;

use crate::config::ProcessConfig;
use crate::{AppError, Result};

/// Environment variables kept when the environment is not inherited.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// A freshly spawned child with its stdio captured.
#[derive(Debug)]
pub struct ChildConnection {
    /// OS process id.
    pub pid: u32,
    /// Process handle; dropping it kills the child.
    pub child: Child,
    /// Write side of the child's stdin.
    pub stdin: ChildStdin,
    /// Read side of the child's stdout (protocol stream).
    pub stdout: ChildStdout,
    /// Read side of the child's stderr (diagnostics).
    pub stderr: ChildStderr,
}

/// Build the launch command for `config`.
#[must_use]
pub fn build_command(config: &ProcessConfig) -> Command {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    if !config.inherit_env {
        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
    }
    cmd.envs(&config.env);

    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Spawn the child process described by `config`.
///
/// # Errors
///
/// Returns `AppError::ProcessUnavailable` if the OS refuses to start the
/// process or a stdio pipe cannot be captured.
pub fn spawn_child(config: &ProcessConfig) -> Result<ChildConnection> {
    let mut child = build_command(config).spawn().map_err(|err| {
        AppError::ProcessUnavailable(format!("failed to spawn `{}`: {err}", config.command))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::ProcessUnavailable("failed to capture child stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::ProcessUnavailable("failed to capture child stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::ProcessUnavailable("failed to capture child stderr".into()))?;

    let pid = child.id().unwrap_or(0);
    info!(
        pid,
        command = %config.command,
        args = ?config.args,
        "child process spawned"
    );

    Ok(ChildConnection {
        pid,
        child,
        stdin,
        stdout,
        stderr,
    })
}
