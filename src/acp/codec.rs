//! NDJSON framing for the peer's output stream.
//!
//! [`AcpCodec`] wraps [`tokio_util::codec::LinesCodec`] with a maximum line
//! length so an unterminated or maliciously large message cannot exhaust
//! memory. [`LineFramer`] sits on top of it: it accepts raw byte chunks in
//! whatever sizes the pipe delivers them, and yields one parsed JSON value per
//! complete line.
//!
//! # Framing rules
//!
//! - A line is dispatched only once its `\n` terminator has been seen; the
//!   trailing fragment stays buffered for the next [`LineFramer::feed`].
//! - Lines that are not valid JSON objects (startup banners, diagnostics) are
//!   discarded and counted in [`StreamCounters`], never surfaced as errors.
//! - Blank lines are skipped silently.

use std::sync::Arc;

use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::debug;

use crate::acp::counters::StreamCounters;
use crate::{AppError, Result};

/// Maximum line length accepted on the inbound stream: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited codec for the ACP peer stream.
///
/// Inbound lines longer than [`MAX_LINE_BYTES`] return
/// [`AppError::Acp`]`("line too long: …")`; the codec then discards input up
/// to the next newline. Outbound strings are encoded as `item\n`.
#[derive(Debug)]
pub struct AcpCodec(LinesCodec);

impl AcpCodec {
    /// Create a new `AcpCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for AcpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AcpCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for AcpCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

/// Incremental line framer over raw stdout chunks.
#[derive(Debug)]
pub struct LineFramer {
    codec: AcpCodec,
    buffer: BytesMut,
    counters: Arc<StreamCounters>,
}

impl LineFramer {
    /// Create an empty framer that reports discards to `counters`.
    #[must_use]
    pub fn new(counters: Arc<StreamCounters>) -> Self {
        Self {
            codec: AcpCodec::new(),
            buffer: BytesMut::new(),
            counters,
        }
    }

    /// Append `chunk` and return every complete message now available, in
    /// arrival order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(line)) => {
                    if let Some(value) = self.parse_line(&line) {
                        messages.push(value);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    // Over-long or non-UTF-8 line; the codec has already
                    // skipped past it.
                    debug!(error = %err, "framer: discarding undecodable line");
                    self.counters.malformed_line();
                }
            }
        }
        messages
    }

    /// Bytes buffered while waiting for a terminator.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn parse_line(&self, line: &str) -> Option<Value> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if value.is_object() => {
                self.counters.line_received();
                Some(value)
            }
            Ok(_) => {
                debug!(raw = trimmed, "framer: discarding non-object json line");
                self.counters.malformed_line();
                None
            }
            Err(err) => {
                debug!(error = %err, raw = trimmed, "framer: discarding non-json line");
                self.counters.malformed_line();
                None
            }
        }
    }
}

/// Map a [`LinesCodecError`] to an [`AppError`].
fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Acp(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
