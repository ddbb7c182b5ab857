#![forbid(unsafe_code)]

//! Host-side ACP engine.
//!
//! Spawns an agent peer, drives it through the `initialize` / `session/new`
//! / `session/prompt` exchange over newline-delimited JSON-RPC on its stdio,
//! and lets it call only the tools the host has whitelisted.

pub mod acp;
pub mod audit;
pub mod config;
pub mod engine;
pub mod errors;
pub mod tools;

pub use config::{EngineConfig, PeerCommand};
pub use engine::{AcpEngine, EngineEvent, ProcessOptions, ProcessOutcome, SessionState};
pub use errors::{AppError, Result};
