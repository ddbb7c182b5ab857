#![forbid(unsafe_code)]

//! `acp-toolhost`: send one prompt to an ACP agent and print the outcome.
//!
//! Loads configuration, starts the configured peer, relays host events to
//! the log, and writes the [`ProcessOutcome`](acp_toolhost::ProcessOutcome)
//! as JSON on stdout. Logs go to stderr.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use acp_toolhost::{
    AcpEngine, AppError, EngineConfig, EngineEvent, PeerCommand, ProcessOptions, Result,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-toolhost", about = "Drive an ACP agent with whitelisted tools", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the working directory handed to the agent.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Agent binary; overrides `[peer]` from the configuration.
    #[arg(long)]
    peer: Option<String>,

    /// Extra arguments for `--peer`.
    #[arg(long = "peer-arg", allow_hyphen_values = true)]
    peer_args: Vec<String>,

    /// Run the agent on plain pipes instead of a pseudo-terminal.
    #[arg(long)]
    no_pty: bool,

    /// Prompt text sent to the agent.
    prompt: String,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("acp-toolhost bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from_path(path)?,
        None => EngineConfig::default(),
    };

    if let Some(ws) = args.workspace {
        config.working_dir = Some(ws);
        config.validate()?;
    }

    let mut options = ProcessOptions::default();
    if let Some(program) = args.peer {
        let mut peer = PeerCommand::new(program).with_pty_wrap(!args.no_pty);
        peer.args = args.peer_args;
        options.peer = Some(peer);
    } else if args.no_pty {
        if let Some(peer) = config.peer.as_mut() {
            peer.pty_wrap = false;
        }
    }
    info!("configuration loaded");

    // ── Build engine and relay events ───────────────────
    let (engine, mut events) = AcpEngine::new(config)?;
    let relay = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    // ── Run the prompt, honouring ctrl-c ────────────────
    let outcome = tokio::select! {
        outcome = engine.process(&args.prompt, options) => outcome,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Err(AppError::Acp("interrupted".into()))
        }
    };

    engine.stop();
    let stats = engine.stats();
    info!(
        malformed_lines = stats.malformed_lines,
        dropped_writes = stats.dropped_writes,
        dropped_events = stats.dropped_events,
        "engine stopped"
    );
    drop(engine);
    relay.abort();

    let outcome = outcome?;
    let rendered = serde_json::to_string_pretty(&outcome)
        .map_err(|err| AppError::Io(format!("failed to render outcome: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::SessionReady { session_id } => info!(session_id, "session ready"),
        EngineEvent::Update { params } => debug!(%params, "session update"),
        EngineEvent::Stderr { text } => debug!(stderr = text.trim_end(), "agent stderr"),
        EngineEvent::Error { message } => error!(error = message.as_str(), "engine error"),
        EngineEvent::ProcessClosed { exit_code, reason } => {
            warn!(?exit_code, reason, "agent process closed");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
