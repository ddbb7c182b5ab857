//! ACP reader task.
//!
//! Reads raw chunks from the peer's stdout, feeds them through a
//! [`LineFramer`], and hands every complete message to the engine's
//! [`Dispatcher`] in arrival order.
//!
//! Partial lines stay buffered across reads; whatever fragment is left when
//! the stream closes is dropped, since a line is never dispatched before its
//! terminator arrives. Process exit itself is reported by the spawner's exit
//! monitor, not by this task.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::LineFramer;
use crate::acp::counters::StreamCounters;
use crate::engine::dispatch::Dispatcher;

/// Size of each read from the peer's stdout.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Reader task: frame stdout and dispatch each message.
///
/// Returns on EOF, on an unrecoverable read error, or when `cancel` fires.
pub async fn run_reader<R>(
    engine_id: String,
    mut stdout: R,
    counters: Arc<StreamCounters>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framer = LineFramer::new(counters);
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(engine_id, "acp reader: cancellation received, stopping");
                break;
            }

            read = stdout.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        let leftover = framer.pending_bytes();
                        debug!(engine_id, leftover, "acp reader: EOF detected");
                        break;
                    }
                    Ok(n) => {
                        for message in framer.feed(&chunk[..n]) {
                            dispatcher.dispatch(message);
                        }
                    }
                    Err(e) => {
                        warn!(engine_id, error = %e, "acp reader: IO error, stopping");
                        break;
                    }
                }
            }
        }
    }
}
