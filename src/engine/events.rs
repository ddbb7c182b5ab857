//! Host-facing engine events.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::acp::counters::StreamCounters;

/// Events delivered to the host, at most once each.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The peer assigned a session id; prompts may now be sent.
    SessionReady {
        /// Peer-assigned session identifier.
        session_id: String,
    },
    /// The peer sent a `session/update` notification.
    Update {
        /// Notification params, verbatim.
        params: Value,
    },
    /// The peer wrote to stderr.
    Stderr {
        /// Lossily decoded stderr chunk.
        text: String,
    },
    /// A local orchestration failure (spawn failure, bad handshake reply).
    Error {
        /// Human-readable description.
        message: String,
    },
    /// The peer process ended.
    ProcessClosed {
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Human-readable reason.
        reason: String,
    },
}

/// Non-blocking sender side of the host event channel.
///
/// Emitting never waits: if the host is not draining the channel the event
/// is dropped and counted, so a slow host cannot stall the protocol.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EngineEvent>,
    counters: Arc<StreamCounters>,
}

impl EventSink {
    /// Wrap `tx`, reporting drops to `counters`.
    #[must_use]
    pub fn new(tx: mpsc::Sender<EngineEvent>, counters: Arc<StreamCounters>) -> Self {
        Self { tx, counters }
    }

    /// Queue `event`; returns `false` if it was dropped.
    pub fn emit(&self, event: EngineEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "event channel unavailable, event dropped");
                self.counters.event_dropped();
                false
            }
        }
    }
}
