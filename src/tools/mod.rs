//! Tool whitelist, handlers, and call auditing.
//!
//! The peer may only run tools the host registered. [`ToolRegistry`] holds
//! the whitelist together with each tool's description, input schema, and
//! bound [`ToolHandler`], and keeps append-only logs of accepted and rejected
//! calls.

pub mod log;
pub mod registry;

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde_json::Value;

pub use log::{CallStatus, RejectedCallRecord, ToolCallRecord};
pub use registry::ToolRegistry;

/// Boxed future returned by a [`ToolHandler`].
pub type ToolFuture = Pin<Box<dyn Future<Output = crate::Result<Value>> + Send>>;

/// Host-supplied implementation of one tool.
///
/// Implemented for any `Fn(Value) -> impl Future<Output = Result<Value>>`
/// closure, so most hosts never implement it by hand.
pub trait ToolHandler: Send + Sync {
    /// Run the tool with the peer-supplied `params`.
    fn call(&self, params: Value) -> ToolFuture;
}

impl<F, Fut> ToolHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = crate::Result<Value>> + Send + 'static,
{
    fn call(&self, params: Value) -> ToolFuture {
        Box::pin(self(params))
    }
}

/// Public description of a whitelisted tool, as advertised to the peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema of the tool's parameters.
    pub input_schema: Value,
}
