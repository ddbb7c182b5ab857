//! Whitelist enforcement and tool invocation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::log::{CallStatus, RejectedCallRecord, ToolCallRecord};
use super::{ToolDescriptor, ToolHandler};
use crate::audit::{AuditEntry, AuditEventType, AuditLogger};
use crate::{AppError, Result};

/// Reason recorded for every whitelist rejection.
pub const REJECTION_REASON: &str = "Not in whitelist";

/// Error message reported when a tool handler panics.
pub const HANDLER_PANICKED: &str = "tool handler panicked";

struct ToolEntry {
    descriptor: ToolDescriptor,
    handler: Option<Arc<dyn ToolHandler>>,
}

/// Whitelist of callable tools plus the audit logs of every attempt.
///
/// Tools keep their registration order. Re-registering a name replaces its
/// descriptor and handler in place.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Mutex<Vec<ToolEntry>>,
    call_log: Mutex<Vec<ToolCallRecord>>,
    rejected_log: Mutex<Vec<RejectedCallRecord>>,
    audit: Option<Arc<dyn AuditLogger>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry that mirrors call events into `audit`.
    #[must_use]
    pub fn with_audit(audit: Arc<dyn AuditLogger>) -> Self {
        Self {
            audit: Some(audit),
            ..Self::default()
        }
    }

    /// Whitelist `name` and bind `handler` to it.
    pub fn register<H>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: H,
    ) -> ToolDescriptor
    where
        H: ToolHandler + 'static,
    {
        self.insert(
            name.into(),
            description.into(),
            input_schema,
            Some(Arc::new(handler)),
        )
    }

    /// Whitelist `name` without binding a handler.
    ///
    /// Calls to such a tool pass validation but fail with
    /// [`AppError::UnboundTool`].
    pub fn declare(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> ToolDescriptor {
        self.insert(name.into(), description.into(), input_schema, None)
    }

    /// `true` if `name` is whitelisted.
    #[must_use]
    pub fn is_whitelisted(&self, name: &str) -> bool {
        lock(&self.tools).iter().any(|t| t.descriptor.name == name)
    }

    /// Whitelisted names in registration order.
    #[must_use]
    pub fn whitelist(&self) -> Vec<String> {
        lock(&self.tools)
            .iter()
            .map(|t| t.descriptor.name.clone())
            .collect()
    }

    /// Descriptors of every whitelisted tool in registration order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        lock(&self.tools)
            .iter()
            .map(|t| t.descriptor.clone())
            .collect()
    }

    /// Check `name` against the whitelist.
    ///
    /// A refusal is appended to the rejected-call log together with a
    /// snapshot of the whitelist.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotWhitelisted`] if `name` is not registered.
    pub fn validate(&self, name: &str) -> Result<()> {
        let available = {
            let tools = lock(&self.tools);
            if tools.iter().any(|t| t.descriptor.name == name) {
                return Ok(());
            }
            tools
                .iter()
                .map(|t| t.descriptor.name.clone())
                .collect::<Vec<_>>()
        };

        let message = format!(
            "Tool not available. Only these tools are available: {}",
            available.join(", ")
        );
        warn!(tool = name, "tool call rejected: not in whitelist");

        lock(&self.rejected_log).push(RejectedCallRecord {
            timestamp: Utc::now(),
            attempted_tool: name.to_owned(),
            reason: REJECTION_REASON.to_owned(),
            available_tools: available,
        });
        self.audit(
            AuditEntry::new(AuditEventType::ToolRejected)
                .with_tool(name.to_owned())
                .with_reason(REJECTION_REASON.to_owned()),
        );

        Err(AppError::NotWhitelisted(message))
    }

    /// Validate and run `name` with `params`.
    ///
    /// An accepted call is logged as `executing` before the handler runs and
    /// updated in place to `completed` (with its result) or `failed`.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotWhitelisted`] if `name` is not registered.
    /// - [`AppError::UnboundTool`] if `name` has no handler.
    /// - [`AppError::ToolFailed`] if the handler returns an error or panics.
    ///
    /// The handler runs on its own task, so this must be awaited inside a
    /// tokio runtime.
    pub async fn invoke(&self, name: &str, params: Value) -> Result<Value> {
        self.validate(name)?;

        let handler = lock(&self.tools)
            .iter()
            .find(|t| t.descriptor.name == name)
            .and_then(|t| t.handler.clone());

        let index = {
            let mut log = lock(&self.call_log);
            log.push(ToolCallRecord::executing(name, params.clone()));
            log.len() - 1
        };
        self.audit(
            AuditEntry::new(AuditEventType::ToolCall)
                .with_tool(name.to_owned())
                .with_parameters(params.clone()),
        );
        debug!(tool = name, "tool call accepted");

        let Some(handler) = handler else {
            let message = format!("Unknown tool: {name}");
            self.finish(index, Err(message.clone()));
            return Err(AppError::UnboundTool(message));
        };

        // A panicking handler takes down only its own task.
        let outcome = match tokio::spawn(handler.call(params)).await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                error!(tool = name, error = %join_err, "tool handler panicked");
                Err(AppError::Tool(HANDLER_PANICKED.to_owned()))
            }
        };

        match outcome {
            Ok(result) => {
                self.finish(index, Ok(result.clone()));
                info!(tool = name, "tool call completed");
                Ok(result)
            }
            Err(err) => {
                let message = err.message().to_owned();
                self.finish(index, Err(message.clone()));
                warn!(tool = name, error = %err, "tool call failed");
                Err(AppError::ToolFailed(message))
            }
        }
    }

    /// Copy of the accepted-call log, oldest first.
    #[must_use]
    pub fn call_log(&self) -> Vec<ToolCallRecord> {
        lock(&self.call_log).clone()
    }

    /// The last `window` accepted calls, oldest first.
    #[must_use]
    pub fn recent_calls(&self, window: usize) -> Vec<ToolCallRecord> {
        let log = lock(&self.call_log);
        let start = log.len().saturating_sub(window);
        log[start..].to_vec()
    }

    /// Copy of the rejected-call log, oldest first.
    #[must_use]
    pub fn rejected_log(&self) -> Vec<RejectedCallRecord> {
        lock(&self.rejected_log).clone()
    }

    fn insert(
        &self,
        name: String,
        description: String,
        input_schema: Value,
        handler: Option<Arc<dyn ToolHandler>>,
    ) -> ToolDescriptor {
        let descriptor = ToolDescriptor {
            name,
            description,
            input_schema,
        };

        let mut tools = lock(&self.tools);
        if let Some(existing) = tools
            .iter_mut()
            .find(|t| t.descriptor.name == descriptor.name)
        {
            debug!(tool = descriptor.name.as_str(), "tool re-registered, replacing");
            existing.descriptor = descriptor.clone();
            existing.handler = handler;
        } else {
            debug!(tool = descriptor.name.as_str(), bound = handler.is_some(), "tool registered");
            tools.push(ToolEntry {
                descriptor: descriptor.clone(),
                handler,
            });
        }
        descriptor
    }

    fn finish(&self, index: usize, outcome: std::result::Result<Value, String>) {
        let (tool, entry) = {
            let mut log = lock(&self.call_log);
            let Some(record) = log.get_mut(index) else {
                return;
            };
            let entry = match outcome {
                Ok(result) => {
                    let summary = summarize(&result);
                    record.status = CallStatus::Completed;
                    record.result = Some(result);
                    AuditEntry::new(AuditEventType::ToolCompleted).with_result(summary)
                }
                Err(message) => {
                    record.status = CallStatus::Failed;
                    record.error = Some(message.clone());
                    AuditEntry::new(AuditEventType::ToolFailed).with_reason(message)
                }
            };
            (record.tool_name.clone(), entry)
        };
        self.audit(entry.with_tool(tool));
    }

    fn audit(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            if let Err(err) = audit.log_entry(entry) {
                warn!(%err, "failed to write tool audit entry");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Truncated single-line rendering of a tool result for the audit trail.
fn summarize(result: &Value) -> String {
    const MAX_SUMMARY_CHARS: usize = 200;
    let text = result.to_string();
    if text.chars().count() <= MAX_SUMMARY_CHARS {
        text
    } else {
        let mut cut: String = text.chars().take(MAX_SUMMARY_CHARS).collect();
        cut.push('…');
        cut
    }
}
