//! Bridge configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::jsonrpc::codec::DEFAULT_MAX_LINE_BYTES;
use crate::jsonrpc::message::CANCELLED_METHOD;
use crate::{AppError, Result};

/// Upper bound for every `[timeouts]` setting: one week.
pub const MAX_TIMEOUT_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Child process launch settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessConfig {
    /// Executable to launch (e.g. `github-mcp-server`).
    #[serde(default)]
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables set on the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Whether the child inherits the bridge's environment. When `false`
    /// only a fixed allowlist plus `env` reaches the child.
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    /// Working directory of the child; defaults to the bridge's own.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Maximum length of one stdout line before it is discarded.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Number of recent stderr lines kept for diagnostics.
    #[serde(default = "default_stderr_lines")]
    pub stderr_lines: usize,
    /// Grace period between `SIGTERM` and a forced kill.
    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            inherit_env: true,
            working_dir: None,
            max_line_bytes: default_max_line_bytes(),
            stderr_lines: default_stderr_lines(),
            stop_grace_seconds: default_stop_grace_seconds(),
        }
    }
}

impl ProcessConfig {
    /// Grace period as a [`Duration`].
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

/// Restart policy applied after the child crashes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RestartConfig {
    /// Consecutive restart attempts before giving up; 0 disables restarts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first restart attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for the doubling backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Uptime after which a restarted child resets the attempt counter.
    #[serde(default = "default_stable_after_seconds")]
    pub stable_after_seconds: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            stable_after_seconds: default_stable_after_seconds(),
        }
    }
}

impl RestartConfig {
    /// Backoff before restart attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let delay = self.initial_backoff_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Uptime threshold as a [`Duration`].
    #[must_use]
    pub fn stable_after(&self) -> Duration {
        Duration::from_secs(self.stable_after_seconds)
    }
}

/// Deadlines for requests and sessions.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Deadline for one proxied request.
    #[serde(default = "default_request_seconds")]
    pub request_seconds: u64,
    /// Idle period after which a session expires.
    #[serde(default = "default_session_idle_seconds")]
    pub session_idle_seconds: u64,
    /// Interval of the background timeout and expiry sweep.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_seconds: default_request_seconds(),
            session_idle_seconds: default_session_idle_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Request deadline as a [`Duration`].
    #[must_use]
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_seconds)
    }

    /// Session idle ceiling as a [`Duration`].
    #[must_use]
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_seconds)
    }

    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// Session and stream behaviour.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Adopt unknown client-supplied session ids instead of rejecting them.
    #[serde(default)]
    pub accept_client_session_ids: bool,
    /// Messages buffered per event stream before delivery drops.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Notification sent to the child when a request is abandoned; empty
    /// disables cancellation notices.
    #[serde(default = "default_cancel_method")]
    pub cancel_method: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            accept_client_session_ids: false,
            stream_buffer: default_stream_buffer(),
            cancel_method: default_cancel_method(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_stderr_lines() -> usize {
    200
}

fn default_stop_grace_seconds() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_stable_after_seconds() -> u64 {
    60
}

fn default_request_seconds() -> u64 {
    600
}

fn default_session_idle_seconds() -> u64 {
    1800
}

fn default_sweep_interval_seconds() -> u64 {
    5
}

fn default_stream_buffer() -> usize {
    256
}

fn default_cancel_method() -> String {
    CANCELLED_METHOD.into()
}

/// Top-level bridge configuration parsed from `bridge.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Address the HTTP transport binds to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Child process settings.
    #[serde(default)]
    pub process: ProcessConfig,
    /// Restart policy.
    #[serde(default)]
    pub restart: RestartConfig,
    /// Request and session deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Session behaviour.
    #[serde(default)]
    pub sessions: SessionConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            process: ProcessConfig::default(),
            restart: RestartConfig::default(),
            timeouts: TimeoutConfig::default(),
            sessions: SessionConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// The child command may be left empty here and supplied later from the
    /// command line; [`BridgeConfig::validate`] must run before use.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing fails or a numeric setting is
    /// out of range.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate_limits()?;
        Ok(config)
    }

    /// Validate the complete configuration, including the child command.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.process.command.trim().is_empty() {
            return Err(AppError::Config(
                "process.command must be set in the config file or after `--`".into(),
            ));
        }
        self.validate_limits()
    }

    fn validate_limits(&self) -> Result<()> {
        if self.process.max_line_bytes == 0 {
            return Err(AppError::Config(
                "process.max_line_bytes must be greater than zero".into(),
            ));
        }
        if self.timeouts.request_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.request_seconds must be greater than zero".into(),
            ));
        }
        if self.timeouts.session_idle_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.session_idle_seconds must be greater than zero".into(),
            ));
        }
        if self.timeouts.sweep_interval_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.sweep_interval_seconds must be greater than zero".into(),
            ));
        }
        for (name, value) in [
            ("request_seconds", self.timeouts.request_seconds),
            ("session_idle_seconds", self.timeouts.session_idle_seconds),
            ("sweep_interval_seconds", self.timeouts.sweep_interval_seconds),
        ] {
            if value > MAX_TIMEOUT_SECONDS {
                return Err(AppError::Config(format!(
                    "timeouts.{name} must not exceed {MAX_TIMEOUT_SECONDS}"
                )));
            }
        }
        if self.sessions.stream_buffer == 0 {
            return Err(AppError::Config(
                "sessions.stream_buffer must be greater than zero".into(),
            ));
        }
        if self.restart.initial_backoff_ms > self.restart.max_backoff_ms {
            return Err(AppError::Config(
                "restart.initial_backoff_ms must not exceed restart.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Cancellation method, or `None` when cancellation notices are disabled.
    #[must_use]
    pub fn cancel_method(&self) -> Option<&str> {
        let method = self.sessions.cancel_method.trim();
        (!method.is_empty()).then_some(method)
    }
}
