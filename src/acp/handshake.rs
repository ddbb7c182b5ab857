//! Payloads for the ACP session handshake.
//!
//! The exchange with the peer is:
//!
//! 1. The peer may send `initialize` at any time; it is answered at once
//!    with [`initialize_result`]: protocol version, server identity, the
//!    whitelisted tools, the security configuration, and the standing
//!    instruction if one is configured.
//! 2. After a short settle interval the engine sends `session/new` with
//!    [`session_new_params`]. The `sessionId` in the response, read by
//!    [`session_id_from`], makes the session ready.
//! 3. Each prompt goes out as `session/prompt` with
//!    [`session_prompt_params`], carrying text built by [`enriched_prompt`].

use std::fmt::Write as _;
use std::path::Path;

use serde_json::{json, Value};

use crate::config::{EngineConfig, ServerIdentity};
use crate::tools::ToolDescriptor;

/// Correlation id reserved for `session/new`.
pub const SESSION_NEW_ID: u64 = 1;

/// What the engine advertises about itself at `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProfile {
    /// Protocol version string.
    pub protocol_version: String,
    /// Server name and version.
    pub server: ServerIdentity,
    /// Standing instruction, if configured.
    pub instruction: Option<String>,
}

impl ServerProfile {
    /// Profile described by `config`.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            protocol_version: config.protocol_version.clone(),
            server: config.server.clone(),
            instruction: config.instruction.clone(),
        }
    }
}

/// Result payload answering an `initialize` request.
#[must_use]
pub fn initialize_result(profile: &ServerProfile, tools: &[ToolDescriptor]) -> Value {
    let allowed: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    let agent_capabilities: Vec<Value> = allowed
        .iter()
        .map(|name| json!({ "type": "tool", "name": name, "whitelisted": true }))
        .collect();

    let mut result = json!({
        "protocolVersion": profile.protocol_version,
        "serverInfo": {
            "name": profile.server.name,
            "version": profile.server.version,
        },
        "tools": tools,
        "securityConfiguration": {
            "toolWhitelistEnabled": true,
            "allowedTools": allowed,
            "rejectionBehavior": "strict",
        },
        "agentCapabilities": agent_capabilities,
    });

    if let (Some(instruction), Some(obj)) = (&profile.instruction, result.as_object_mut()) {
        obj.insert("instruction".to_owned(), Value::String(instruction.clone()));
    }
    result
}

/// Parameters of the `session/new` request.
#[must_use]
pub fn session_new_params(working_dir: &Path) -> Value {
    json!({
        "cwd": working_dir.to_string_lossy(),
        "mcpServers": [],
    })
}

/// Parameters of a `session/prompt` request.
#[must_use]
pub fn session_prompt_params(session_id: &str, text: &str) -> Value {
    json!({
        "sessionId": session_id,
        "prompt": [
            { "type": "text", "text": text }
        ],
    })
}

/// Session identifier carried by a `session/new` result.
#[must_use]
pub fn session_id_from(result: &Value) -> Option<String> {
    result
        .get("sessionId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

/// Prompt text sent to the peer: instruction, tool list, then the user text.
#[must_use]
pub fn enriched_prompt(instruction: Option<&str>, tools: &[ToolDescriptor], text: &str) -> String {
    let mut prompt = String::new();

    if let Some(instruction) = instruction.filter(|i| !i.trim().is_empty()) {
        prompt.push_str(instruction);
        prompt.push_str("\n\n");
    }

    if !tools.is_empty() {
        prompt.push_str("Available tools:\n");
        for tool in tools {
            let _ = writeln!(prompt, "- {}: {}", tool.name, tool.description);
            let _ = writeln!(prompt, "  Input schema: {}", tool.input_schema);
        }
        prompt.push('\n');
    }

    prompt.push_str(text);
    prompt
}
