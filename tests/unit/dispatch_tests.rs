//! Unit tests for inbound routing through `Dispatcher`.
//!
//! The dispatcher is wired to an in-memory outbound channel and event
//! channel so every reply and host event can be observed directly.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use acp_toolhost::acp::correlator::{Correlator, Settlement};
use acp_toolhost::acp::counters::StreamCounters;
use acp_toolhost::acp::handshake::ServerProfile;
use acp_toolhost::acp::writer::Outbound;
use acp_toolhost::config::ServerIdentity;
use acp_toolhost::engine::{Dispatcher, EngineEvent, EventSink};
use acp_toolhost::tools::registry::HANDLER_PANICKED;
use acp_toolhost::tools::{CallStatus, ToolRegistry};
use acp_toolhost::AppError;

struct Harness {
    dispatcher: Dispatcher,
    registry: Arc<ToolRegistry>,
    correlator: Arc<Correlator>,
    counters: Arc<StreamCounters>,
    sent: mpsc::UnboundedReceiver<Value>,
    events: mpsc::Receiver<EngineEvent>,
}

fn harness() -> Harness {
    let counters = Arc::new(StreamCounters::default());
    let registry = Arc::new(ToolRegistry::new());
    let correlator = Arc::new(Correlator::new());

    let outbound = Outbound::new(Arc::clone(&counters));
    let (tx, sent) = mpsc::unbounded_channel();
    outbound.attach(tx);

    let (event_tx, events) = mpsc::channel(16);
    let sink = EventSink::new(event_tx, Arc::clone(&counters));

    let profile = Arc::new(ServerProfile {
        protocol_version: "1.0".to_owned(),
        server: ServerIdentity {
            name: "toolhost-test".to_owned(),
            version: "9.9.9".to_owned(),
        },
        instruction: Some("Use tools sparingly.".to_owned()),
    });

    let dispatcher = Dispatcher::new(
        "engine-test".to_owned(),
        Arc::clone(&registry),
        Arc::clone(&correlator),
        outbound,
        sink,
        profile,
    );

    Harness {
        dispatcher,
        registry,
        correlator,
        counters,
        sent,
        events,
    }
}

async fn next_sent(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("reply within deadline")
        .expect("outbound channel open")
}

#[tokio::test]
async fn initialize_is_answered_with_capabilities() {
    let mut h = harness();
    h.registry.declare("read_file", "Read a file", json!({"type": "object"}));

    h.dispatcher
        .dispatch(json!({"jsonrpc": "2.0", "id": 0, "method": "initialize", "params": {}}));

    let reply = next_sent(&mut h.sent).await;
    assert_eq!(reply["id"], 0);
    let result = &reply["result"];
    assert_eq!(result["protocolVersion"], "1.0");
    assert_eq!(result["serverInfo"]["name"], "toolhost-test");
    assert_eq!(result["serverInfo"]["version"], "9.9.9");
    assert_eq!(result["tools"][0]["name"], "read_file");
    assert_eq!(result["tools"][0]["inputSchema"], json!({"type": "object"}));
    assert_eq!(result["securityConfiguration"]["allowedTools"], json!(["read_file"]));
    assert_eq!(result["instruction"], "Use tools sparingly.");
}

#[tokio::test]
async fn success_response_settles_pending_request() {
    let h = harness();
    let rx = h
        .correlator
        .register(1, Duration::from_secs(5))
        .expect("register");

    h.dispatcher
        .dispatch(json!({"jsonrpc": "2.0", "id": 1, "result": {"sessionId": "s-9"}}));

    assert_eq!(
        rx.await.expect("settled"),
        Settlement::Success(json!({"sessionId": "s-9"}))
    );
}

#[tokio::test]
async fn error_response_settles_as_failure() {
    let h = harness();
    let rx = h
        .correlator
        .register(2, Duration::from_secs(5))
        .expect("register");

    h.dispatcher
        .dispatch(json!({"id": 2, "error": {"code": -32000, "message": "overloaded"}}));

    match rx.await.expect("settled") {
        Settlement::Failure(err) => assert_eq!(err.message, "overloaded"),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn response_for_unknown_id_is_ignored() {
    let h = harness();
    let _rx = h
        .correlator
        .register(3, Duration::from_secs(5))
        .expect("register");

    h.dispatcher.dispatch(json!({"id": 99, "result": {}}));
    h.dispatcher.dispatch(json!({"id": "3", "result": {}}));

    assert!(h.correlator.is_pending(3));
}

#[tokio::test]
async fn whitelisted_tool_call_is_answered_with_result() {
    let mut h = harness();
    h.registry.register("echo", "", json!({}), |p: Value| async move {
        Ok::<Value, AppError>(p)
    });

    h.dispatcher
        .dispatch(json!({"id": 21, "method": "tools/echo", "params": {"a": 1}}));

    let reply = next_sent(&mut h.sent).await;
    assert_eq!(reply, json!({"jsonrpc": "2.0", "id": 21, "result": {"a": 1}}));
    assert_eq!(h.counters.snapshot().writes_sent, 1);
}

#[tokio::test]
async fn non_whitelisted_tool_call_gets_error_reply() {
    let mut h = harness();
    h.registry.declare("echo", "", json!({}));

    h.dispatcher
        .dispatch(json!({"id": 22, "method": "tools/rm", "params": {}}));

    let reply = next_sent(&mut h.sent).await;
    assert_eq!(reply["id"], 22);
    assert_eq!(reply["error"]["code"], -32603);
    assert_eq!(
        reply["error"]["message"],
        "Tool not available. Only these tools are available: echo"
    );
    assert_eq!(h.registry.rejected_log().len(), 1);
}

#[tokio::test]
async fn unbound_tool_call_gets_unknown_tool_error() {
    let mut h = harness();
    h.registry.declare("foo", "", json!({}));

    h.dispatcher.dispatch(json!({"id": 23, "method": "tools/foo"}));

    let reply = next_sent(&mut h.sent).await;
    assert_eq!(reply["error"]["message"], "Unknown tool: foo");
}

#[tokio::test]
async fn panicking_handler_gets_error_reply_and_failed_record() {
    let mut h = harness();
    h.registry.register("boom", "", json!({}), |p: Value| async move {
        if p.is_object() {
            panic!("handler bug");
        }
        Ok::<Value, AppError>(p)
    });

    h.dispatcher
        .dispatch(json!({"id": 42, "method": "tools/boom", "params": {}}));

    let reply = next_sent(&mut h.sent).await;
    assert_eq!(reply["id"], 42);
    assert_eq!(reply["error"]["code"], -32603);
    assert_eq!(reply["error"]["message"], HANDLER_PANICKED);

    let log = h.registry.call_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, CallStatus::Failed);
    assert_eq!(log[0].error.as_deref(), Some(HANDLER_PANICKED));

    // The dispatcher keeps serving after the panic.
    h.registry.register("echo", "", json!({}), |p: Value| async move {
        Ok::<Value, AppError>(p)
    });
    h.dispatcher
        .dispatch(json!({"id": 43, "method": "tools/echo", "params": {"ok": true}}));
    let reply = next_sent(&mut h.sent).await;
    assert_eq!(reply["result"], json!({"ok": true}));
}

#[tokio::test]
async fn session_update_is_forwarded_without_side_effects() {
    let mut h = harness();
    let _rx = h
        .correlator
        .register(1, Duration::from_secs(5))
        .expect("register");
    let params = json!({"sessionId": "s", "update": {"anything": [1, 2, 3]}});

    h.dispatcher
        .dispatch(json!({"jsonrpc": "2.0", "method": "session/update", "params": params}));

    let event = h.events.try_recv().expect("update event emitted");
    assert_eq!(event, EngineEvent::Update { params });
    assert_eq!(h.correlator.pending_count(), 1);
    assert!(h.sent.try_recv().is_err(), "notifications are never answered");
}

#[tokio::test]
async fn unrecognized_message_is_dropped_quietly() {
    let mut h = harness();

    h.dispatcher
        .dispatch(json!({"id": 5, "method": "fs/write_text_file", "params": {}}));

    assert!(h.sent.try_recv().is_err());
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn reply_to_detached_stream_is_counted_as_dropped() {
    let counters = Arc::new(StreamCounters::default());
    let outbound = Outbound::new(Arc::clone(&counters));

    assert!(!outbound.is_writable());
    assert!(!outbound.send(json!({"id": 1, "result": {}})));
    assert_eq!(counters.snapshot().dropped_writes, 1);
}

#[tokio::test]
async fn full_event_channel_drops_and_counts() {
    let counters = Arc::new(StreamCounters::default());
    let (tx, _rx) = mpsc::channel(1);
    let sink = EventSink::new(tx, Arc::clone(&counters));

    assert!(sink.emit(EngineEvent::Stderr { text: "a".into() }));
    assert!(!sink.emit(EngineEvent::Stderr { text: "b".into() }));

    assert_eq!(counters.snapshot().dropped_events, 1);
}
