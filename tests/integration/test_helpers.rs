//! Shared helpers for integration tests that drive a scripted peer.
//!
//! The peer is a POSIX `sh` loop reading NDJSON requests from stdin and
//! answering with canned lines, so the full spawn → handshake → prompt path
//! runs without a real agent binary.

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;

use acp_toolhost::config::TimeoutConfig;
use acp_toolhost::{EngineConfig, EngineEvent, PeerCommand};

/// Reply line for `session/new`, always correlated on the reserved id 1.
pub const SESSION_NEW_REPLY: &str =
    r#"echo '{"jsonrpc":"2.0","id":1,"result":{"sessionId":"sess-1"}}'"#;

/// Shell snippet that extracts the numeric request id of `$line` into `$id`.
pub const EXTRACT_ID: &str = r#"id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')"#;

/// Build a peer command that runs `script` under `sh -c` on plain pipes.
pub fn scripted_peer(script: &str) -> PeerCommand {
    PeerCommand::new("sh")
        .arg("-c")
        .arg(script)
        .with_pty_wrap(false)
}

/// Wrap `branches` (extra `case` arms) in the standard request loop.
///
/// `session/new` is always answered with [`SESSION_NEW_REPLY`]; any line no
/// arm matches is appended to `replies.log` in the working directory.
pub fn peer_loop(branches: &str) -> String {
    format!(
        r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"session/new"'*)
      {SESSION_NEW_REPLY}
      ;;
{branches}
    *)
      printf '%s\n' "$line" >> replies.log
      ;;
  esac
done
"#
    )
}

/// Engine configuration rooted at `dir` with short deadlines.
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        working_dir: Some(dir.canonicalize().expect("canonical tempdir")),
        timeouts: TimeoutConfig {
            startup_seconds: 5,
            prompt_seconds: 5,
            settle_millis: 20,
        },
        ..EngineConfig::default()
    }
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn wait_for_event<F>(events: &mut mpsc::Receiver<EngineEvent>, pred: F) -> EngineEvent
where
    F: Fn(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("matching event within deadline")
}
