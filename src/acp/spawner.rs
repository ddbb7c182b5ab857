//! ACP peer process spawner.
//!
//! Spawns the peer with:
//! - piped stdin/stdout/stderr and `kill_on_drop(true)`,
//! - the caller-supplied working directory,
//! - `TERM` forced to a minimal, non-interactive terminal type,
//! - optionally, a `script(1)` wrapper that gives the peer a pseudo-terminal
//!   so interactive CLIs behave as if attached to one. Terminal echo is
//!   switched off inside the wrapper so our own requests are not read back.
//!
//! Exit and stderr are observed by background tasks ([`monitor_exit`],
//! [`pump_stderr`]) that report through caller-supplied callbacks.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PeerCommand;
use crate::{AppError, Result};

/// Everything needed to launch one peer process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Peer command line.
    pub peer: PeerCommand,
    /// Directory the peer starts in.
    pub working_dir: PathBuf,
}

/// Live stdio connection to a spawned peer.
#[derive(Debug)]
pub struct PeerConnection {
    /// Child process handle, kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Peer's stdin, written by the writer task.
    pub stdin: ChildStdin,
    /// Peer's stdout, read by the reader task.
    pub stdout: ChildStdout,
    /// Peer's stderr, surfaced as diagnostics.
    pub stderr: ChildStderr,
}

/// How the process ended, as reported by [`monitor_exit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Human-readable reason.
    pub reason: String,
}

/// Build the [`Command`] for `peer`, applying the terminal wrapper if requested.
#[must_use]
pub fn build_command(peer: &PeerCommand, working_dir: &Path) -> Command {
    let mut cmd = if peer.pty_wrap && cfg!(unix) {
        wrapped_command(peer)
    } else {
        let mut cmd = Command::new(&peer.program);
        cmd.args(&peer.args);
        cmd
    };

    cmd.env("TERM", &peer.term)
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Spawn the peer described by `config`.
///
/// # Errors
///
/// - `AppError::Spawn("…")` if the OS refuses to start the process.
/// - `AppError::Spawn("failed to capture …")` if a stdio pipe is missing.
pub fn spawn_peer(config: &SpawnConfig) -> Result<PeerConnection> {
    let mut cmd = build_command(&config.peer, &config.working_dir);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Spawn(format!("{}: {err}", config.peer.program)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture peer stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture peer stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture peer stderr".into()))?;

    info!(
        program = config.peer.program.as_str(),
        pid = child.id(),
        cwd = %config.working_dir.display(),
        pty_wrap = config.peer.pty_wrap,
        "peer process spawned"
    );

    Ok(PeerConnection {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Await child exit and report it once through `on_exit`.
///
/// When `cancel` fires first the child is killed, reaped, and reported with
/// reason `"terminated by host"`.
#[must_use]
pub fn monitor_exit<F>(
    engine_id: String,
    mut child: Child,
    cancel: CancellationToken,
    on_exit: F,
) -> JoinHandle<()>
where
    F: FnOnce(ExitReport) + Send + 'static,
{
    tokio::spawn(async move {
        let report = tokio::select! {
            result = child.wait() => match result {
                Ok(status) => {
                    let exit_code = status.code();
                    let reason = exit_code.map_or_else(
                        || "process terminated by signal".to_owned(),
                        |c| format!("process exited with code {c}"),
                    );
                    ExitReport { exit_code, reason }
                }
                Err(err) => {
                    warn!(engine_id, %err, "error waiting for peer process");
                    ExitReport { exit_code: None, reason: format!("wait error: {err}") }
                }
            },
            () = cancel.cancelled() => {
                if let Err(err) = child.kill().await {
                    warn!(engine_id, %err, "failed to kill peer process");
                }
                ExitReport {
                    exit_code: None,
                    reason: "terminated by host".to_owned(),
                }
            }
        };

        info!(engine_id, reason = report.reason.as_str(), "peer process closed");
        on_exit(report);
    })
}

/// Forward every stderr chunk to `on_text`; never fatal.
#[must_use]
pub fn pump_stderr<R, F>(engine_id: String, mut stderr: R, on_text: F) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(String) + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0_u8; 4096];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => on_text(String::from_utf8_lossy(&chunk[..n]).into_owned()),
                Err(err) => {
                    debug!(engine_id, %err, "stderr pump: read failed, stopping");
                    break;
                }
            }
        }
    })
}

/// `script(1)` invocation that runs the peer on a pseudo-terminal.
fn wrapped_command(peer: &PeerCommand) -> Command {
    let inner = format!("stty -echo 2>/dev/null; exec {}", shell_command_line(peer));

    let mut cmd = Command::new("script");
    if cfg!(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    )) {
        // BSD syntax: script [-q] file command...
        cmd.args(["-q", "/dev/null", "sh", "-c", &inner]);
    } else {
        // util-linux syntax: script [-q] [-e] -c command file
        cmd.args(["-q", "-e", "-c", &inner, "/dev/null"]);
    }
    cmd
}

/// Render the peer command as a single POSIX shell command line.
fn shell_command_line(peer: &PeerCommand) -> String {
    std::iter::once(peer.program.as_str())
        .chain(peer.args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}
