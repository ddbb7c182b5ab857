//! Session controller: the host-facing ACP engine.
//!
//! [`AcpEngine`] drives one peer process through one session at a time:
//!
//! ```text
//! Unstarted ──start──▶ Starting ──session/new ok──▶ Ready
//!     ▲                   │                           │
//!     └──spawn failure────┘        stop / exit        ▼
//!                         Starting ─────────────▶  Closed ──start──▶ Starting
//! ```
//!
//! Every engine owns its own correlator, registry, outbound stream, and
//! counters; nothing is shared between instances.

mod audit_scope;
pub mod dispatch;
pub mod events;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::acp::correlator::{Correlator, Settlement};
use crate::acp::counters::{StreamCounters, StreamStats};
use crate::acp::handshake::{self, ServerProfile, SESSION_NEW_ID};
use crate::acp::message::{self, METHOD_SESSION_NEW, METHOD_SESSION_PROMPT};
use crate::acp::reader::run_reader;
use crate::acp::spawner::{self, ExitReport, PeerConnection, SpawnConfig};
use crate::acp::writer::{run_writer, Outbound};
use crate::audit::{AuditEntry, AuditEventType, AuditLogger, JsonlAuditWriter};
use crate::config::{EngineConfig, PeerCommand};
use crate::tools::{
    CallStatus, RejectedCallRecord, ToolCallRecord, ToolDescriptor, ToolHandler, ToolRegistry,
};
use crate::{AppError, Result};

use audit_scope::ScopedAudit;
pub use dispatch::Dispatcher;
pub use events::{EngineEvent, EventSink};

/// Lifecycle state of the engine's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No peer has been started yet.
    Unstarted,
    /// Peer spawned; waiting for `session/new` to return a session id.
    Starting,
    /// Session established; prompts are accepted.
    Ready,
    /// Session ended by `stop` or peer exit.
    Closed,
}

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Lifecycle state.
    pub state: SessionState,
    /// Peer-assigned session id, present only while `Ready`.
    pub session_id: Option<String>,
    /// Working directory of the current or last peer.
    pub working_dir: Option<PathBuf>,
}

/// Per-call overrides for [`AcpEngine::process`].
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Peer to start if no session is running; falls back to the configured peer.
    pub peer: Option<PeerCommand>,
    /// Size of the recent call window; falls back to `recent_call_window`.
    pub recent_window: Option<usize>,
}

/// Result of [`AcpEngine::process`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    /// The caller's original text.
    pub text: String,
    /// Settlement of the `session/prompt` request.
    pub result: Settlement,
    /// Most recent call-log entries.
    pub recent_calls: Vec<ToolCallRecord>,
    /// Full call log.
    pub call_log: Vec<ToolCallRecord>,
}

struct LiveProcess {
    generation: u64,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct EngineInner {
    engine_id: String,
    config: EngineConfig,
    registry: Arc<ToolRegistry>,
    correlator: Arc<Correlator>,
    counters: Arc<StreamCounters>,
    outbound: Outbound,
    events: EventSink,
    profile: Arc<ServerProfile>,
    audit: Option<Arc<dyn AuditLogger>>,
    session: watch::Sender<SessionSnapshot>,
    live: Mutex<Option<LiveProcess>>,
    generation: AtomicU64,
}

/// Host-facing ACP engine.
///
/// Cheap to clone; clones drive the same peer and session.
#[derive(Clone)]
pub struct AcpEngine {
    inner: Arc<EngineInner>,
}

impl AcpEngine {
    /// Build an engine and the receiver for its host events.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if `audit_log_dir` is set and cannot be created.
    pub fn new(config: EngineConfig) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        let audit: Option<Arc<dyn AuditLogger>> = match &config.audit_log_dir {
            Some(dir) => Some(Arc::new(JsonlAuditWriter::new(dir.clone())?)),
            None => None,
        };
        Ok(Self::with_audit(config, audit))
    }

    /// Build an engine that records audit entries into `audit`.
    ///
    /// Every entry reaching `audit` carries this engine's id and, while a
    /// session is ready, its session id.
    #[must_use]
    pub fn with_audit(
        config: EngineConfig,
        audit: Option<Arc<dyn AuditLogger>>,
    ) -> (Self, mpsc::Receiver<EngineEvent>) {
        let engine_id = Uuid::new_v4().to_string();
        let counters = Arc::new(StreamCounters::default());
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (session, session_rx) = watch::channel(SessionSnapshot {
            state: SessionState::Unstarted,
            session_id: None,
            working_dir: None,
        });
        let audit = audit.map(|sink| -> Arc<dyn AuditLogger> {
            Arc::new(ScopedAudit::new(engine_id.clone(), session_rx, sink))
        });
        let registry = match &audit {
            Some(audit) => ToolRegistry::with_audit(Arc::clone(audit)),
            None => ToolRegistry::new(),
        };

        let inner = EngineInner {
            engine_id,
            profile: Arc::new(ServerProfile::from_config(&config)),
            config,
            registry: Arc::new(registry),
            correlator: Arc::new(Correlator::new()),
            outbound: Outbound::new(Arc::clone(&counters)),
            events: EventSink::new(event_tx, Arc::clone(&counters)),
            counters,
            audit,
            session,
            live: Mutex::new(None),
            generation: AtomicU64::new(0),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            event_rx,
        )
    }

    /// Whitelist `name` and bind `handler`; re-registration replaces the tool.
    pub fn register_tool<H>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: H,
    ) -> ToolDescriptor
    where
        H: ToolHandler + 'static,
    {
        self.inner
            .registry
            .register(name, description, input_schema, handler)
    }

    /// Whitelist `name` without a handler.
    pub fn declare_tool(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> ToolDescriptor {
        self.inner.registry.declare(name, description, input_schema)
    }

    /// Start `peer` and wait for its session.
    ///
    /// Returns the existing session id if already `Ready`; if already
    /// `Starting`, waits on the same ready signal.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`] if the peer cannot be started.
    /// - [`AppError::InitializationTimeout`] if no session id arrives within
    ///   `timeouts.startup_seconds`.
    /// - [`AppError::Acp`] if the peer exits before the session is ready.
    pub async fn start(&self, peer: &PeerCommand) -> Result<String> {
        let working_dir = self.inner.config.resolved_working_dir()?;
        let rx = self.inner.session.subscribe();

        let mut launch = false;
        let mut ready_id = None;
        self.inner.session.send_if_modified(|s| match s.state {
            SessionState::Ready => {
                ready_id.clone_from(&s.session_id);
                false
            }
            SessionState::Starting => false,
            SessionState::Unstarted | SessionState::Closed => {
                s.state = SessionState::Starting;
                s.session_id = None;
                s.working_dir = Some(working_dir.clone());
                launch = true;
                true
            }
        });

        if let Some(session_id) = ready_id {
            return Ok(session_id);
        }

        if launch {
            if let Err(err) = self.launch(peer, working_dir) {
                error!(engine_id = self.inner.engine_id, error = %err, "peer spawn failed");
                self.inner.session.send_modify(|s| {
                    s.state = SessionState::Unstarted;
                    s.session_id = None;
                });
                self.inner.events.emit(EngineEvent::Error {
                    message: err.to_string(),
                });
                return Err(err);
            }
        }

        self.wait_ready(rx).await
    }

    /// Send `text` to the ready session and wait for the reply.
    ///
    /// The text is prefixed with the standing instruction and the tool list.
    /// A peer that never answers settles to [`Settlement::TimedOut`].
    ///
    /// # Errors
    ///
    /// - [`AppError::NoActiveSession`] unless the session is `Ready`.
    /// - [`AppError::Acp`] if the request could not be registered.
    pub async fn send_prompt(&self, text: &str) -> Result<Settlement> {
        let session_id = {
            let snapshot = self.inner.session.borrow();
            match (&snapshot.state, &snapshot.session_id) {
                (SessionState::Ready, Some(id)) => id.clone(),
                (state, _) => {
                    return Err(AppError::NoActiveSession(format!(
                        "session is {state:?}; call start first"
                    )))
                }
            }
        };

        let prompt = handshake::enriched_prompt(
            self.inner.config.instruction.as_deref(),
            &self.inner.registry.descriptors(),
            text,
        );
        let id = self.inner.next_request_id();
        let rx = self
            .inner
            .correlator
            .register(id, self.inner.config.timeouts.prompt())?;

        let request = message::request(
            id,
            METHOD_SESSION_PROMPT,
            handshake::session_prompt_params(&session_id, &prompt),
        );
        if !self.inner.outbound.send(request) {
            warn!(
                engine_id = self.inner.engine_id,
                request_id = id,
                "prompt dropped: stream not writable; waiting for timeout"
            );
        }
        debug!(engine_id = self.inner.engine_id, session_id, request_id = id, "prompt sent");

        rx.await
            .map_err(|_| AppError::Acp(format!("request {id} abandoned before settlement")))
    }

    /// Start a session if needed, send `text`, and collect the call log.
    ///
    /// # Errors
    ///
    /// - [`AppError::Config`] if a session must be started and no peer is
    ///   available from `options` or the configuration.
    /// - Any error from [`start`](Self::start) or [`send_prompt`](Self::send_prompt).
    pub async fn process(&self, text: &str, options: ProcessOptions) -> Result<ProcessOutcome> {
        if self.state() != SessionState::Ready {
            let peer = options
                .peer
                .or_else(|| self.inner.config.peer.clone())
                .ok_or_else(|| AppError::Config("no peer command configured".into()))?;
            self.start(&peer).await?;
        }

        let result = self.send_prompt(text).await?;
        let window = options
            .recent_window
            .unwrap_or(self.inner.config.recent_call_window);

        Ok(ProcessOutcome {
            text: text.to_owned(),
            result,
            recent_calls: self.inner.registry.recent_calls(window),
            call_log: self.inner.registry.call_log(),
        })
    }

    /// Terminate the peer, if any, and close the session.
    ///
    /// Unconditional: safe in every state. Pending prompt waiters are left to
    /// their own deadlines.
    pub fn stop(&self) {
        let live = lock(&self.inner.live).take();
        if let Some(live) = live {
            info!(
                engine_id = self.inner.engine_id,
                generation = live.generation,
                tasks = live.tasks.len(),
                "stopping peer"
            );
            live.cancel.cancel();
        }
        self.inner.reset_session();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.session.borrow().state
    }

    /// Current session id, present only while `Ready`.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.inner.session.borrow().session_id.clone()
    }

    /// Current session snapshot.
    #[must_use]
    pub fn session(&self) -> SessionSnapshot {
        self.inner.session.borrow().clone()
    }

    /// Receiver that observes every session state change.
    #[must_use]
    pub fn subscribe_session(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.session.subscribe()
    }

    /// Descriptors of every whitelisted tool.
    #[must_use]
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.inner.registry.descriptors()
    }

    /// Shared tool registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    /// Accepted-call log, oldest first.
    #[must_use]
    pub fn tool_call_log(&self) -> Vec<ToolCallRecord> {
        self.inner.registry.call_log()
    }

    /// Rejected-call log, oldest first.
    #[must_use]
    pub fn rejected_call_log(&self) -> Vec<RejectedCallRecord> {
        self.inner.registry.rejected_log()
    }

    /// Number of outbound requests awaiting settlement.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Snapshot of the drop/malformed counters.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        self.inner.counters.snapshot()
    }

    /// Unique id of this engine instance, used in logs.
    #[must_use]
    pub fn engine_id(&self) -> &str {
        &self.inner.engine_id
    }

    /// Dispatcher bound to this engine's state.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        self.inner.dispatcher()
    }

    fn launch(&self, peer: &PeerCommand, working_dir: PathBuf) -> Result<()> {
        let inner = &self.inner;
        let PeerConnection {
            child,
            stdin,
            stdout,
            stderr,
        } = spawner::spawn_peer(&SpawnConfig {
            peer: peer.clone(),
            working_dir,
        })?;

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let engine_id = inner.engine_id.clone();

        // Installed before any task runs so `is_current` holds for them.
        *lock(&inner.live) = Some(LiveProcess {
            generation,
            cancel: cancel.clone(),
            tasks: Vec::new(),
        });

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        inner.outbound.attach(msg_tx);

        let writer = tokio::spawn({
            let engine_id = engine_id.clone();
            let cancel = cancel.child_token();
            async move {
                if let Err(err) = run_writer(engine_id.clone(), stdin, msg_rx, cancel).await {
                    warn!(engine_id, error = %err, "acp writer stopped");
                }
            }
        });

        let reader = tokio::spawn(run_reader(
            engine_id.clone(),
            stdout,
            Arc::clone(&inner.counters),
            inner.dispatcher(),
            cancel.child_token(),
        ));

        let stderr = {
            let events = inner.events.clone();
            spawner::pump_stderr(engine_id.clone(), stderr, move |text| {
                events.emit(EngineEvent::Stderr { text });
            })
        };

        let monitor = {
            let inner = Arc::clone(inner);
            spawner::monitor_exit(engine_id, child, cancel.clone(), move |report| {
                inner.on_process_exit(generation, report);
            })
        };

        let handshake_task = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                tokio::time::sleep(inner.config.timeouts.settle()).await;
                inner.create_session(generation).await;
            })
        };

        if let Some(live) = lock(&inner.live)
            .as_mut()
            .filter(|live| live.generation == generation)
        {
            live.tasks = vec![writer, reader, stderr, monitor, handshake_task];
        }
        Ok(())
    }

    async fn wait_ready(&self, mut rx: watch::Receiver<SessionSnapshot>) -> Result<String> {
        let deadline = self.inner.config.timeouts.startup();

        let outcome = tokio::time::timeout(
            deadline,
            rx.wait_for(|s| s.state != SessionState::Starting),
        )
        .await;

        match outcome {
            Err(_elapsed) => Err(AppError::InitializationTimeout(format!(
                "no session established within {deadline:?}"
            ))),
            Ok(Err(_closed)) => Err(AppError::Acp("session state channel closed".into())),
            Ok(Ok(snapshot)) => match (&snapshot.state, &snapshot.session_id) {
                (SessionState::Ready, Some(id)) => Ok(id.clone()),
                (state, _) => Err(AppError::Acp(format!(
                    "peer left {state:?} before the session was ready"
                ))),
            },
        }
    }
}

impl EngineInner {
    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.engine_id.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.correlator),
            self.outbound.clone(),
            self.events.clone(),
            Arc::clone(&self.profile),
        )
    }

    /// Next prompt id; never the id reserved for `session/new`.
    fn next_request_id(&self) -> u64 {
        loop {
            let id = self.correlator.next_id();
            if id != SESSION_NEW_ID {
                return id;
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.live)
            .as_ref()
            .is_some_and(|live| live.generation == generation)
    }

    async fn create_session(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }

        let working_dir = self.session.borrow().working_dir.clone().unwrap_or_default();
        let rx = match self
            .correlator
            .register(SESSION_NEW_ID, self.config.timeouts.startup())
        {
            Ok(rx) => rx,
            Err(err) => {
                warn!(engine_id = self.engine_id, error = %err, "session/new not sent");
                return;
            }
        };

        let request = message::request(
            SESSION_NEW_ID,
            METHOD_SESSION_NEW,
            handshake::session_new_params(&working_dir),
        );
        if !self.outbound.send(request) {
            self.correlator.discard(SESSION_NEW_ID);
            warn!(engine_id = self.engine_id, "session/new dropped: stream not writable");
            return;
        }
        debug!(engine_id = self.engine_id, cwd = %working_dir.display(), "session/new sent");

        match rx.await {
            Ok(Settlement::Success(result)) => self.on_session_created(generation, &result),
            Ok(Settlement::Failure(err)) => {
                warn!(
                    engine_id = self.engine_id,
                    code = err.code,
                    error = err.message.as_str(),
                    "session/new rejected"
                );
                self.events.emit(EngineEvent::Error {
                    message: format!("session/new failed: {}", err.message),
                });
            }
            Ok(Settlement::TimedOut) => {
                warn!(engine_id = self.engine_id, "session/new timed out");
            }
            Err(_) => debug!(engine_id = self.engine_id, "session/new discarded"),
        }
    }

    fn on_session_created(&self, generation: u64, result: &Value) {
        let Some(session_id) = handshake::session_id_from(result) else {
            warn!(engine_id = self.engine_id, %result, "session/new result missing sessionId");
            self.events.emit(EngineEvent::Error {
                message: "session/new result missing sessionId".into(),
            });
            return;
        };

        if !self.is_current(generation) {
            debug!(engine_id = self.engine_id, session_id, "stale session/new result ignored");
            return;
        }

        self.session.send_modify(|s| {
            s.state = SessionState::Ready;
            s.session_id = Some(session_id.clone());
        });
        info!(engine_id = self.engine_id, session_id, "session ready");

        self.audit(
            AuditEntry::new(AuditEventType::SessionStart).with_session(session_id.clone()),
        );
        self.events.emit(EngineEvent::SessionReady { session_id });
    }

    fn on_process_exit(&self, generation: u64, report: ExitReport) {
        let current = {
            let mut live = lock(&self.live);
            if live.as_ref().is_some_and(|l| l.generation == generation) {
                live.take();
                true
            } else {
                false
            }
        };

        if current {
            self.reset_session();
        }

        self.events.emit(EngineEvent::ProcessClosed {
            exit_code: report.exit_code,
            reason: report.reason,
        });
    }

    /// Detach the stream and force the session to `Closed`.
    fn reset_session(&self) {
        self.outbound.detach();
        self.correlator.discard(SESSION_NEW_ID);

        let mut prior_session = None;
        self.session.send_modify(|s| {
            s.state = SessionState::Closed;
            prior_session = s.session_id.take();
        });

        if let Some(session_id) = prior_session {
            self.audit(
                AuditEntry::new(AuditEventType::SessionStop)
                    .with_session(session_id)
                    .with_result(self.call_totals()),
            );
        }
    }

    /// One-line tally of the registry's call logs, recorded when a session ends.
    fn call_totals(&self) -> String {
        let calls = self.registry.call_log();
        let count = |status: CallStatus| calls.iter().filter(|c| c.status == status).count();
        format!(
            "{} accepted ({} completed, {} failed, {} executing), {} rejected",
            calls.len(),
            count(CallStatus::Completed),
            count(CallStatus::Failed),
            count(CallStatus::Executing),
            self.registry.rejected_log().len()
        )
    }

    fn audit(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            if let Err(err) = audit.log_entry(entry) {
                warn!(engine_id = self.engine_id, %err, "failed to write session audit entry");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
