//! Structured audit trail for tool calls and session lifecycle.
//!
//! The in-memory call logs on [`ToolRegistry`](crate::tools::ToolRegistry)
//! cover a single engine's lifetime. When `audit_log_dir` is configured the
//! same events are also appended, one JSON object per line, to one file per
//! engine session by [`JsonlAuditWriter`].

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event classification for audit entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Whitelisted tool accepted and started.
    ToolCall,
    /// Tool handler returned a result.
    ToolCompleted,
    /// Tool handler failed or was unbound.
    ToolFailed,
    /// Tool refused by the whitelist.
    ToolRejected,
    /// Session became ready.
    SessionStart,
    /// Session ended by `stop` or process exit.
    SessionStop,
}

/// A structured record of one engine event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// ISO 8601 timestamp.
    pub timestamp: DateTime<Utc>,
    /// Event classification.
    pub event_type: AuditEventType,
    /// Engine instance that produced the entry.
    pub engine_id: Option<String>,
    /// Peer-assigned session identifier.
    pub session_id: Option<String>,
    /// Tool name for tool events.
    pub tool_name: Option<String>,
    /// Tool parameters for tool events.
    pub parameters: Option<serde_json::Value>,
    /// Brief result description.
    pub result_summary: Option<String>,
    /// Failure or rejection reason.
    pub reason: Option<String>,
}

impl AuditEntry {
    /// Construct a minimal audit entry for the given event type.
    #[must_use]
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            engine_id: None,
            session_id: None,
            tool_name: None,
            parameters: None,
            result_summary: None,
            reason: None,
        }
    }

    /// Set the engine identifier.
    #[must_use]
    pub fn with_engine(mut self, engine_id: String) -> Self {
        self.engine_id = Some(engine_id);
        self
    }

    /// Set the session identifier.
    #[must_use]
    pub fn with_session(mut self, session_id: String) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Set the tool name.
    #[must_use]
    pub fn with_tool(mut self, tool_name: String) -> Self {
        self.tool_name = Some(tool_name);
        self
    }

    /// Set the tool parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Set the result summary.
    #[must_use]
    pub fn with_result(mut self, summary: String) -> Self {
        self.result_summary = Some(summary);
        self
    }

    /// Set the failure or rejection reason.
    #[must_use]
    pub fn with_reason(mut self, reason: String) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Writes structured audit entries to a persistent store.
///
/// Implementations must be [`Send`] and [`Sync`] so one logger can be shared
/// by every task of an engine.
pub trait AuditLogger: Send + Sync {
    /// Record a single audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()>;
}

pub use writer::JsonlAuditWriter;
