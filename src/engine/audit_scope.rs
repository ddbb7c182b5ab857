//! Attribution of audit entries to the engine and its live session.

use std::sync::Arc;

use tokio::sync::watch;

use super::SessionSnapshot;
use crate::audit::{AuditEntry, AuditLogger};
use crate::Result;

/// [`AuditLogger`] that fills in `engine_id` and the current session id
/// before forwarding to the configured sink.
///
/// Ids already set on an entry are kept, so a stop entry can name the
/// session that just ended after the snapshot has been cleared.
pub(crate) struct ScopedAudit {
    engine_id: String,
    session: watch::Receiver<SessionSnapshot>,
    sink: Arc<dyn AuditLogger>,
}

impl ScopedAudit {
    pub(crate) fn new(
        engine_id: String,
        session: watch::Receiver<SessionSnapshot>,
        sink: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            engine_id,
            session,
            sink,
        }
    }
}

impl AuditLogger for ScopedAudit {
    fn log_entry(&self, mut entry: AuditEntry) -> Result<()> {
        if entry.engine_id.is_none() {
            entry.engine_id = Some(self.engine_id.clone());
        }
        if entry.session_id.is_none() {
            entry.session_id.clone_from(&self.session.borrow().session_id);
        }
        self.sink.log_entry(entry)
    }
}
