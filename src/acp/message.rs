//! JSON-RPC envelopes exchanged with the ACP peer.
//!
//! Outbound envelopes are built with [`request`], [`success`], and
//! [`error`]. Inbound messages are bucketed by [`classify`] into exactly one
//! [`Inbound`] variant.
//!
//! # Known inbound shapes
//!
//! | Shape                          | Maps to                         |
//! |--------------------------------|---------------------------------|
//! | `initialize` request           | [`Inbound::Initialize`]         |
//! | `tools/<name>` request         | [`Inbound::ToolInvocation`]     |
//! | `session/update` notification  | [`Inbound::SessionUpdate`]      |
//! | `id` + `result`                | [`Inbound::Success`]            |
//! | `id` + `error`                 | [`Inbound::Error`]              |
//! | *(anything else)*              | [`Inbound::Unrecognized`]       |

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// JSON-RPC protocol version stamped on every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error code used for every error this engine reports to the peer.
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// Method prefix reserved for tool invocations.
pub const TOOL_METHOD_PREFIX: &str = "tools/";

/// Handshake method answered with the capability description.
pub const METHOD_INITIALIZE: &str = "initialize";

/// Notification carrying agent progress for the host.
pub const METHOD_SESSION_UPDATE: &str = "session/update";

/// Outbound request creating a session.
pub const METHOD_SESSION_NEW: &str = "session/new";

/// Outbound request carrying a user prompt.
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";

/// Error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Peer opened the handshake.
    Initialize {
        /// Request id to answer.
        id: Value,
    },
    /// Successful response to one of our requests.
    Success {
        /// Correlation id.
        id: Value,
        /// Response payload.
        result: Value,
    },
    /// Error response to one of our requests.
    Error {
        /// Correlation id.
        id: Value,
        /// Error payload.
        error: RpcError,
    },
    /// Peer asked to run a tool.
    ToolInvocation {
        /// Request id to answer.
        id: Value,
        /// Tool name with the reserved prefix removed.
        tool: String,
        /// Tool arguments.
        params: Value,
    },
    /// Progress notification for the host.
    SessionUpdate {
        /// Notification payload, forwarded verbatim.
        params: Value,
    },
    /// Anything else; ignored.
    Unrecognized,
}

/// Build a request envelope.
#[must_use]
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build a success response envelope.
#[must_use]
pub fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

/// Build an error response envelope with [`INTERNAL_ERROR_CODE`].
#[must_use]
pub fn error(id: Value, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": INTERNAL_ERROR_CODE,
            "message": message,
        },
    })
}

/// Classify an inbound message.
///
/// A message carrying a `method` is a request or notification and is never
/// treated as a response, even if it also carries `result`.
#[must_use]
pub fn classify(message: &Value) -> Inbound {
    let Some(obj) = message.as_object() else {
        return Inbound::Unrecognized;
    };

    let id = obj.get("id").filter(|id| !id.is_null()).cloned();

    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        return classify_method(method, id, obj);
    }

    let Some(id) = id else {
        return Inbound::Unrecognized;
    };

    if let Some(result) = obj.get("result") {
        return Inbound::Success {
            id,
            result: result.clone(),
        };
    }

    if let Some(raw) = obj.get("error") {
        let error = serde_json::from_value::<RpcError>(raw.clone()).unwrap_or_else(|_| RpcError {
            code: INTERNAL_ERROR_CODE,
            message: raw.to_string(),
            data: None,
        });
        return Inbound::Error { id, error };
    }

    Inbound::Unrecognized
}

fn classify_method(method: &str, id: Option<Value>, obj: &Map<String, Value>) -> Inbound {
    let params = obj.get("params").cloned().unwrap_or(Value::Null);

    if method == METHOD_INITIALIZE {
        return match id {
            Some(id) => Inbound::Initialize { id },
            None => Inbound::Unrecognized,
        };
    }

    if method == METHOD_SESSION_UPDATE {
        return Inbound::SessionUpdate { params };
    }

    if let Some(tool) = method.strip_prefix(TOOL_METHOD_PREFIX) {
        return match id {
            Some(id) if !tool.is_empty() => Inbound::ToolInvocation {
                id,
                tool: tool.to_owned(),
                params,
            },
            _ => Inbound::Unrecognized,
        };
    }

    Inbound::Unrecognized
}
