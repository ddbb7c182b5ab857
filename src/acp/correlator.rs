//! Request/response correlation for outbound requests.
//!
//! Every request the engine sends to the peer is registered here under its
//! numeric id together with a [`oneshot`] sender and a deadline timer. The
//! entry is removed by whichever of {matching response, timer} reaches
//! [`Correlator::settle`] first; removal and delivery happen under one lock,
//! so a late response or a late timer finds no entry and does nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::acp::message::RpcError;
use crate::{AppError, Result};

/// Final value delivered to the waiter of a correlated request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Settlement {
    /// Peer answered with `result`.
    Success(Value),
    /// Peer answered with `error`.
    Failure(RpcError),
    /// Deadline elapsed before any answer.
    TimedOut,
}

impl Settlement {
    /// `true` for [`Settlement::TimedOut`].
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    /// Result payload for [`Settlement::Success`].
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    tx: oneshot::Sender<Settlement>,
    timer: Option<AbortHandle>,
}

/// Assigns request ids and settles each exactly once.
#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl Correlator {
    /// Create a correlator whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Return the next id; strictly increasing for the correlator's lifetime.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a pending request and arm its deadline timer.
    ///
    /// Must be called from within a tokio runtime. The returned receiver
    /// yields exactly one [`Settlement`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Acp`] if `id` already has a live entry.
    pub fn register(
        self: &Arc<Self>,
        id: u64,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Settlement>> {
        let (tx, rx) = oneshot::channel();

        let mut pending = self.lock();
        if pending.contains_key(&id) {
            return Err(AppError::Acp(format!("request id {id} is already pending")));
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(correlator) = weak.upgrade() {
                if correlator.settle(id, Settlement::TimedOut) {
                    debug!(request_id = id, ?timeout, "correlator: request timed out");
                }
            }
        });

        pending.insert(
            id,
            PendingRequest {
                tx,
                timer: Some(timer.abort_handle()),
            },
        );
        Ok(rx)
    }

    /// Settle `id` with `settlement`.
    ///
    /// Returns `true` if a live entry was found and removed. A second call for
    /// the same id is a no-op returning `false`.
    pub fn settle(&self, id: u64, settlement: Settlement) -> bool {
        let Some(entry) = self.lock().remove(&id) else {
            return false;
        };

        if !settlement.is_timed_out() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }

        if entry.tx.send(settlement).is_err() {
            warn!(request_id = id, "correlator: waiter dropped before settlement");
        }
        true
    }

    /// Remove `id` without delivering anything; its waiter sees a closed
    /// channel.
    pub fn discard(&self, id: u64) -> bool {
        let Some(entry) = self.lock().remove(&id) else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        true
    }

    /// `true` while `id` awaits settlement.
    #[must_use]
    pub fn is_pending(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of requests awaiting settlement.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}
