//! Records kept for every tool call the peer attempts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Progress of an accepted tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Handler is running.
    Executing,
    /// Handler returned a result.
    Completed,
    /// Handler failed or no handler was bound.
    Failed,
}

/// One accepted call, updated in place as it progresses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    /// When the call was accepted.
    pub timestamp: DateTime<Utc>,
    /// Tool that was called.
    pub tool_name: String,
    /// Parameters supplied by the peer.
    pub params: Value,
    /// Current status.
    pub status: CallStatus,
    /// Handler result once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure message once failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallRecord {
    pub(crate) fn executing(tool_name: &str, params: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            tool_name: tool_name.to_owned(),
            params,
            status: CallStatus::Executing,
            result: None,
            error: None,
        }
    }
}

/// One call refused because the tool is not whitelisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedCallRecord {
    /// When the call was refused.
    pub timestamp: DateTime<Utc>,
    /// Name the peer asked for.
    pub attempted_tool: String,
    /// Why it was refused.
    pub reason: String,
    /// Whitelist at the moment of rejection.
    pub available_tools: Vec<String>,
}
