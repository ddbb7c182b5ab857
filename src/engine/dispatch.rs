//! Routing of classified inbound messages.
//!
//! | Inbound shape         | Handled by                                        |
//! |-----------------------|---------------------------------------------------|
//! | `initialize`          | answered immediately with the capability payload  |
//! | success / error reply | settles the correlated request                    |
//! | `tools/<name>`        | spawned invocation; reply or error sent back      |
//! | `session/update`      | forwarded to the host as [`EngineEvent::Update`]  |
//! | anything else         | logged at `DEBUG` and dropped                     |

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::acp::correlator::{Correlator, Settlement};
use crate::acp::handshake::{initialize_result, ServerProfile};
use crate::acp::message::{self, Inbound};
use crate::acp::writer::Outbound;
use crate::engine::events::{EngineEvent, EventSink};
use crate::tools::ToolRegistry;

/// Routes each inbound message to the component that owns it.
///
/// Cheap to clone; every clone shares the same engine state.
#[derive(Clone)]
pub struct Dispatcher {
    engine_id: String,
    registry: Arc<ToolRegistry>,
    correlator: Arc<Correlator>,
    outbound: Outbound,
    events: EventSink,
    profile: Arc<ServerProfile>,
}

impl Dispatcher {
    /// Assemble a dispatcher over shared engine state.
    #[must_use]
    pub fn new(
        engine_id: String,
        registry: Arc<ToolRegistry>,
        correlator: Arc<Correlator>,
        outbound: Outbound,
        events: EventSink,
        profile: Arc<ServerProfile>,
    ) -> Self {
        Self {
            engine_id,
            registry,
            correlator,
            outbound,
            events,
            profile,
        }
    }

    /// Handle one inbound message.
    ///
    /// Never blocks: tool invocations run on their own task, so later
    /// messages (including responses the tool may be waiting on) keep
    /// flowing. Must be called from within a tokio runtime.
    pub fn dispatch(&self, inbound: Value) {
        match message::classify(&inbound) {
            Inbound::Initialize { id } => {
                let result = initialize_result(&self.profile, &self.registry.descriptors());
                debug!(engine_id = self.engine_id, "dispatch: answering initialize");
                self.outbound.send(message::success(id, result));
            }
            Inbound::Success { id, result } => self.settle(&id, Settlement::Success(result)),
            Inbound::Error { id, error } => self.settle(&id, Settlement::Failure(error)),
            Inbound::ToolInvocation { id, tool, params } => self.spawn_tool_call(id, tool, params),
            Inbound::SessionUpdate { params } => {
                self.events.emit(EngineEvent::Update { params });
            }
            Inbound::Unrecognized => {
                let method = inbound.get("method").and_then(Value::as_str);
                debug!(
                    engine_id = self.engine_id,
                    method, "dispatch: skipping unrecognized message"
                );
            }
        }
    }

    fn settle(&self, id: &Value, settlement: Settlement) {
        let Some(request_id) = id.as_u64() else {
            debug!(engine_id = self.engine_id, %id, "dispatch: response with non-numeric id ignored");
            return;
        };

        if !self.correlator.settle(request_id, settlement) {
            debug!(
                engine_id = self.engine_id,
                request_id, "dispatch: response for unknown or settled request ignored"
            );
        }
    }

    fn spawn_tool_call(&self, id: Value, tool: String, params: Value) {
        let registry = Arc::clone(&self.registry);
        let outbound = self.outbound.clone();
        let engine_id = self.engine_id.clone();

        tokio::spawn(async move {
            let reply = match registry.invoke(&tool, params).await {
                Ok(result) => message::success(id, result),
                Err(err) => {
                    warn!(engine_id, tool, error = %err, "dispatch: tool call refused or failed");
                    message::error(id, err.message())
                }
            };
            outbound.send(reply);
        });
    }
}
