//! JSONL audit sink with one file per engine session.
//!
//! Entries land in `<log_dir>/<engine_id>/<session_id>.jsonl`. Entries that
//! carry no session id (tool calls made during the handshake, a session that
//! never became ready) go to `<log_dir>/<engine_id>/handshake.jsonl`, and
//! entries with no engine id to the `unattributed` directory. Ids are
//! reduced to `[A-Za-z0-9_-]` before they become path components, since
//! session ids are chosen by the peer.

use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, warn};

use super::{AuditEntry, AuditLogger};
use crate::{AppError, Result};

/// Segment name for entries recorded before a session id exists.
pub const HANDSHAKE_SEGMENT: &str = "handshake";

/// Directory name for entries with no engine id.
pub const UNATTRIBUTED_ENGINE: &str = "unattributed";

#[derive(Debug, Clone, PartialEq, Eq)]
struct SegmentKey {
    engine: String,
    session: String,
}

impl SegmentKey {
    fn of(entry: &AuditEntry) -> Self {
        Self {
            engine: file_component(entry.engine_id.as_deref().unwrap_or(UNATTRIBUTED_ENGINE)),
            session: file_component(entry.session_id.as_deref().unwrap_or(HANDSHAKE_SEGMENT)),
        }
    }

    fn path(&self, log_dir: &Path) -> PathBuf {
        log_dir
            .join(&self.engine)
            .join(format!("{}.jsonl", self.session))
    }
}

struct OpenSegment {
    key: SegmentKey,
    writer: BufWriter<fs::File>,
}

/// Audit writer that keeps each engine session in its own JSONL file.
///
/// The most recently written segment stays open; an entry for a different
/// engine or session closes it and opens (or appends to) the other file.
/// Safe to share between engines.
pub struct JsonlAuditWriter {
    log_dir: PathBuf,
    open: Mutex<Option<OpenSegment>>,
}

impl JsonlAuditWriter {
    /// Construct a writer rooted at `log_dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&log_dir).map_err(|e| {
            AppError::Io(format!(
                "failed to create audit log directory {}: {e}",
                log_dir.display()
            ))
        })?;
        Ok(Self {
            log_dir,
            open: Mutex::new(None),
        })
    }

    /// Root directory of every segment.
    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// File that entries for `engine_id` and `session_id` are written to.
    ///
    /// `None` selects the handshake segment.
    #[must_use]
    pub fn session_path(&self, engine_id: &str, session_id: Option<&str>) -> PathBuf {
        SegmentKey {
            engine: file_component(engine_id),
            session: file_component(session_id.unwrap_or(HANDSHAKE_SEGMENT)),
        }
        .path(&self.log_dir)
    }

    fn open_segment(&self, key: SegmentKey) -> Result<OpenSegment> {
        let path = key.path(&self.log_dir);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                AppError::Io(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AppError::Io(format!("failed to open audit log {}: {e}", path.display())))?;
        debug!(path = %path.display(), "audit segment opened");
        Ok(OpenSegment {
            key,
            writer: BufWriter::new(file),
        })
    }
}

impl AuditLogger for JsonlAuditWriter {
    fn log_entry(&self, entry: AuditEntry) -> Result<()> {
        let line = serde_json::to_string(&entry)
            .map_err(|e| AppError::Io(format!("failed to serialize audit entry: {e}")))?;
        let key = SegmentKey::of(&entry);

        let mut guard = self
            .open
            .lock()
            .map_err(|_| AppError::Io("audit writer mutex poisoned".to_owned()))?;

        let segment = match guard.take() {
            Some(open) if open.key == key => open,
            _ => self.open_segment(key)?,
        };
        let segment = guard.insert(segment);

        writeln!(segment.writer, "{line}")
            .and_then(|()| segment.writer.flush())
            .map_err(|e| {
                warn!(error = %e, "audit write failed");
                AppError::Io(format!("audit write failed: {e}"))
            })
    }
}

/// Reduce `raw` to a single safe path component.
fn file_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_owned()
    } else {
        cleaned
    }
}
