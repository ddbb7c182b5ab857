//! Agent Client Protocol (ACP) stream handling.
//!
//! This module owns the wire side of the engine: NDJSON framing over the
//! peer's stdio, JSON-RPC envelopes, request correlation, and the peer
//! process itself.
//!
//! - `codec`: line framing with a per-line size cap.
//! - `message`: envelope builders and inbound classification.
//! - `correlator`: id assignment and exactly-once settlement.
//! - `handshake`: `initialize`, `session/new`, and `session/prompt` payloads.
//! - `reader` / `writer`: the stdout and stdin tasks.
//! - `spawner`: process launch, stderr pump, exit monitor.
//! - `counters`: drop/malformed counters.

pub mod codec;
pub mod correlator;
pub mod counters;
pub mod handshake;
pub mod message;
pub mod reader;
pub mod spawner;
pub mod writer;
