//! Counters for traffic the engine deliberately drops.
//!
//! Malformed inbound lines, writes to a closed stream, and host events that
//! could not be queued are all discarded without raising an error. Each
//! discard bumps one of these counters so an operator can still tell a
//! misbehaving peer from a quiet one.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live, shared counters for a single engine instance.
#[derive(Debug, Default)]
pub struct StreamCounters {
    lines_received: AtomicU64,
    malformed_lines: AtomicU64,
    writes_sent: AtomicU64,
    dropped_writes: AtomicU64,
    dropped_events: AtomicU64,
}

/// Point-in-time copy of [`StreamCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Complete lines parsed into JSON messages.
    pub lines_received: u64,
    /// Lines discarded because they were not valid JSON objects.
    pub malformed_lines: u64,
    /// Messages queued for the peer's stdin.
    pub writes_sent: u64,
    /// Messages discarded because no writable stream was attached.
    pub dropped_writes: u64,
    /// Host events discarded because the event channel was full or closed.
    pub dropped_events: u64,
}

impl StreamCounters {
    pub(crate) fn line_received(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn malformed_line(&self) {
        self.malformed_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write_sent(&self) {
        self.writes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write_dropped(&self) {
        self.dropped_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event_dropped(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values.
    #[must_use]
    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            lines_received: self.lines_received.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            writes_sent: self.writes_sent.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }
}
