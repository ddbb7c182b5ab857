//! Engine configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Command used to launch the ACP peer process.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PeerCommand {
    /// Peer binary (e.g. `claude-code-acp`, `gemini`).
    pub program: String,
    /// Arguments passed to the peer binary.
    #[serde(default)]
    pub args: Vec<String>,
    /// Run the peer under a terminal wrapper so interactive CLIs behave as
    /// if attached to a TTY.
    #[serde(default = "default_true")]
    pub pty_wrap: bool,
    /// Value forced into the peer's `TERM` variable.
    #[serde(default = "default_term")]
    pub term: String,
}

impl PeerCommand {
    /// Build a command for `program` with no arguments and the default wrapper.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            pty_wrap: true,
            term: default_term(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Enable or disable the terminal wrapper.
    #[must_use]
    pub fn with_pty_wrap(mut self, pty_wrap: bool) -> Self {
        self.pty_wrap = pty_wrap;
        self
    }
}

/// Identity advertised in the `initialize` response.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerIdentity {
    /// Server name.
    #[serde(default = "default_server_name")]
    pub name: String,
    /// Server version.
    #[serde(default = "default_server_version")]
    pub version: String,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            version: default_server_version(),
        }
    }
}

/// Deadlines applied to correlated requests.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Bounded wait for the session to become ready after spawn.
    #[serde(default = "default_startup_seconds")]
    pub startup_seconds: u64,
    /// Bounded wait for a `session/prompt` response.
    #[serde(default = "default_prompt_seconds")]
    pub prompt_seconds: u64,
    /// Pause between spawn and the `session/new` request.
    #[serde(default = "default_settle_millis")]
    pub settle_millis: u64,
}

impl TimeoutConfig {
    /// Startup deadline as a [`Duration`].
    #[must_use]
    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_seconds)
    }

    /// Prompt deadline as a [`Duration`].
    #[must_use]
    pub fn prompt(&self) -> Duration {
        Duration::from_secs(self.prompt_seconds)
    }

    /// Settle interval as a [`Duration`].
    #[must_use]
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_seconds: default_startup_seconds(),
            prompt_seconds: default_prompt_seconds(),
            settle_millis: default_settle_millis(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_term() -> String {
    "dumb".into()
}

fn default_server_name() -> String {
    env!("CARGO_PKG_NAME").into()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

fn default_protocol_version() -> String {
    "1.0".into()
}

fn default_startup_seconds() -> u64 {
    30
}

fn default_prompt_seconds() -> u64 {
    120
}

fn default_settle_millis() -> u64 {
    500
}

fn default_recent_call_window() -> usize {
    5
}

fn default_event_buffer() -> usize {
    256
}

/// Engine configuration, usually parsed from `acp-toolhost.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Working directory for the peer and the `session/new` request.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Standing instruction prepended to every prompt and advertised at
    /// `initialize`.
    #[serde(default)]
    pub instruction: Option<String>,
    /// Protocol version advertised at `initialize`.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Server identity advertised at `initialize`.
    #[serde(default)]
    pub server: ServerIdentity,
    /// Default peer used by `process` when the caller supplies none.
    #[serde(default)]
    pub peer: Option<PeerCommand>,
    /// Request deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Number of trailing call-log entries returned by `process`.
    #[serde(default = "default_recent_call_window")]
    pub recent_call_window: usize,
    /// Directory for JSONL audit logs; auditing is disabled when absent.
    #[serde(default)]
    pub audit_log_dir: Option<PathBuf>,
    /// Capacity of the host event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            instruction: None,
            protocol_version: default_protocol_version(),
            server: ServerIdentity::default(),
            peer: None,
            timeouts: TimeoutConfig::default(),
            recent_call_window: default_recent_call_window(),
            audit_log_dir: None,
            event_buffer: default_event_buffer(),
        }
    }
}

impl EngineConfig {
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

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Working directory handed to the peer, falling back to the current
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no directory is configured and the
    /// current directory cannot be determined.
    pub fn resolved_working_dir(&self) -> Result<PathBuf> {
        match &self.working_dir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir()
                .map_err(|err| AppError::Config(format!("cannot determine cwd: {err}"))),
        }
    }

    /// Check invariants and canonicalize the working directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated rule.
    pub fn validate(&mut self) -> Result<()> {
        if self.timeouts.startup_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.startup_seconds must be greater than zero".into(),
            ));
        }

        if self.timeouts.prompt_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.prompt_seconds must be greater than zero".into(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(AppError::Config(
                "event_buffer must be greater than zero".into(),
            ));
        }

        if let Some(peer) = &self.peer {
            if peer.program.trim().is_empty() {
                return Err(AppError::Config("peer.program must not be empty".into()));
            }
        }

        if let Some(dir) = &self.working_dir {
            let canonical = dir
                .canonicalize()
                .map_err(|err| AppError::Config(format!("working_dir invalid: {err}")))?;
            self.working_dir = Some(canonical);
        }

        Ok(())
    }
}
