//! Error types shared across the engine.

use std::fmt::{Display, Formatter};

/// Shared engine result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Engine error enumeration covering every local and protocol failure mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// ACP protocol or stream failure.
    Acp(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// The peer process could not be started.
    Spawn(String),
    /// Tool name is absent from the whitelist.
    NotWhitelisted(String),
    /// Tool name is whitelisted but has no bound handler.
    UnboundTool(String),
    /// A bound tool handler failed while executing.
    ToolFailed(String),
    /// Error returned by a tool handler implementation.
    Tool(String),
    /// A prompt was sent before the session reached `Ready`.
    NoActiveSession(String),
    /// The peer did not produce a session before the startup deadline.
    InitializationTimeout(String),
}

impl AppError {
    /// Message payload without the kind prefix.
    ///
    /// Used when the error is reported to the remote peer, which has no use
    /// for the local classification.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Config(msg)
            | Self::Acp(msg)
            | Self::Io(msg)
            | Self::Spawn(msg)
            | Self::NotWhitelisted(msg)
            | Self::UnboundTool(msg)
            | Self::ToolFailed(msg)
            | Self::Tool(msg)
            | Self::NoActiveSession(msg)
            | Self::InitializationTimeout(msg) => msg,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Acp(msg) => write!(f, "acp: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            Self::NotWhitelisted(msg) => write!(f, "not whitelisted: {msg}"),
            Self::UnboundTool(msg) => write!(f, "unbound tool: {msg}"),
            Self::ToolFailed(msg) => write!(f, "tool failed: {msg}"),
            Self::Tool(msg) => write!(f, "tool: {msg}"),
            Self::NoActiveSession(msg) => write!(f, "no active session: {msg}"),
            Self::InitializationTimeout(msg) => write!(f, "initialization timeout: {msg}"),
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
