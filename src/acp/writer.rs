//! Outbound path to the peer's stdin.
//!
//! [`Outbound`] is the cloneable handle the rest of the engine writes
//! through. It forwards JSON values over an unbounded channel to
//! [`run_writer`], which serialises each value and frames it through
//! [`AcpCodec`] as one NDJSON line on the peer's stdin. When no writer is
//! attached (no process, or the process has gone away) the message is
//! dropped and counted rather than raising an error; there is no
//! back-pressure on this path.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::AcpCodec;
use crate::acp::counters::StreamCounters;
use crate::{AppError, Result};

type Slot = Arc<Mutex<Option<mpsc::UnboundedSender<Value>>>>;

/// Cloneable handle for queueing messages to the peer.
#[derive(Debug, Clone)]
pub struct Outbound {
    slot: Slot,
    counters: Arc<StreamCounters>,
}

impl Outbound {
    /// Create a detached handle; every send is dropped until [`attach`](Self::attach).
    #[must_use]
    pub fn new(counters: Arc<StreamCounters>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            counters,
        }
    }

    /// Route subsequent sends into `tx`, replacing any previous writer.
    pub fn attach(&self, tx: mpsc::UnboundedSender<Value>) {
        *self.lock() = Some(tx);
    }

    /// Drop the current writer; subsequent sends are discarded.
    pub fn detach(&self) {
        self.lock().take();
    }

    /// `true` while a writer is attached and still accepting messages.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Queue `message` for the peer.
    ///
    /// Returns `false` when the message was dropped because the stream is not
    /// writable.
    pub fn send(&self, message: Value) -> bool {
        let delivered = match self.lock().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        };

        if delivered {
            self.counters.write_sent();
        } else {
            debug!("acp writer: stream not writable, message dropped");
            self.counters.write_dropped();
        }
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Value>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Writer task: serialise queued messages and write them to `stdin`.
///
/// Exits cleanly when `cancel` fires or every sender is dropped.
///
/// # Errors
///
/// - [`AppError::Acp`]`("failed to serialise outbound message: …")` if
///   serialisation fails.
/// - [`AppError::Acp`]`("write failed: …")` if the peer's stdin is closed.
pub async fn run_writer<W>(
    engine_id: String,
    mut stdin: W,
    mut msg_rx: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut codec = AcpCodec::new();
    let mut frame = BytesMut::new();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(engine_id, "acp writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(value) = msg else {
                    debug!(engine_id, "acp writer: message channel closed, stopping");
                    break;
                };

                let line = serde_json::to_string(&value).map_err(|e| {
                    AppError::Acp(format!("failed to serialise outbound message: {e}"))
                })?;
                codec.encode(line, &mut frame)?;

                if let Err(e) = write_line(&mut stdin, &frame).await {
                    warn!(engine_id, error = %e, "acp writer: write to stdin failed");
                    return Err(AppError::Acp(format!("write failed: {e}")));
                }
                frame.clear();
            }
        }
    }

    Ok(())
}

async fn write_line<W>(stdin: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    stdin.write_all(bytes).await?;
    stdin.flush().await
}
