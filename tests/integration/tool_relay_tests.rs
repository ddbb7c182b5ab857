//! Integration tests for peer-initiated traffic: `initialize` and tool calls.
//!
//! The scripted peer issues its requests while a prompt is outstanding,
//! reads the engine's replies back from stdin, and records them in
//! `replies.log` in the working directory for inspection.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use acp_toolhost::acp::correlator::Settlement;
use acp_toolhost::audit::{AuditEventType, AuditLogger, JsonlAuditWriter};
use acp_toolhost::tools::CallStatus;
use acp_toolhost::{AcpEngine, AppError, EngineEvent, ProcessOptions};

use super::test_helpers::{peer_loop, scripted_peer, test_config, wait_for_event, EXTRACT_ID};

/// Peer that, on each prompt, calls `echo`, `ghost`, `declared`, and `boom`,
/// logs every reply, then finishes the prompt.
fn tool_calling_peer() -> String {
    peer_loop(&format!(
        r#"
    *'"method":"session/prompt"'*)
      {EXTRACT_ID}
      echo '{{"jsonrpc":"2.0","id":"t1","method":"tools/echo","params":{{"msg":"hi"}}}}'
      IFS= read -r reply; printf '%s\n' "$reply" >> replies.log
      echo '{{"jsonrpc":"2.0","id":"t2","method":"tools/ghost","params":{{}}}}'
      IFS= read -r reply; printf '%s\n' "$reply" >> replies.log
      echo '{{"jsonrpc":"2.0","id":"t3","method":"tools/declared","params":{{}}}}'
      IFS= read -r reply; printf '%s\n' "$reply" >> replies.log
      echo '{{"jsonrpc":"2.0","id":"t4","method":"tools/boom","params":{{}}}}'
      IFS= read -r reply; printf '%s\n' "$reply" >> replies.log
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"stopReason":"end_turn"}}}}\n' "$id"
      ;;"#
    ))
}

fn read_replies(dir: &Path) -> Vec<Value> {
    fs::read_to_string(dir.join("replies.log"))
        .expect("replies.log written by peer")
        .lines()
        .map(|line| serde_json::from_str(line).expect("reply is JSON"))
        .collect()
}

/// Poll `replies.log` until a reply with `id` shows up.
async fn wait_for_reply(dir: &Path, id: i64) -> Value {
    for _ in 0..250 {
        if let Ok(raw) = fs::read_to_string(dir.join("replies.log")) {
            let found = raw
                .lines()
                .filter_map(|line| serde_json::from_str::<Value>(line).ok())
                .find(|r| r["id"] == id);
            if let Some(reply) = found {
                return reply;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("no reply with id {id} logged by the peer");
}

fn reply_for<'a>(replies: &'a [Value], id: &str) -> &'a Value {
    replies
        .iter()
        .find(|r| r["id"] == id)
        .unwrap_or_else(|| panic!("no reply for {id} in {replies:?}"))
}

fn register_tools(engine: &AcpEngine) {
    engine.register_tool(
        "echo",
        "Echo parameters",
        json!({"type": "object"}),
        |p: Value| async move { Ok::<Value, AppError>(json!({"echoed": p})) },
    );
    engine.declare_tool("declared", "Whitelisted, no handler", json!({}));
    engine.register_tool("boom", "Always fails", json!({}), |_: Value| async move {
        Err::<Value, AppError>(AppError::Tool("kaboom".to_owned()))
    });
}

#[tokio::test]
async fn tool_calls_are_answered_and_logged() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (engine, _events) = AcpEngine::new(test_config(temp.path())).expect("engine");
    register_tools(&engine);

    let outcome = engine
        .process(
            "use the tools",
            ProcessOptions {
                peer: Some(scripted_peer(&tool_calling_peer())),
                recent_window: Some(2),
            },
        )
        .await
        .expect("outcome");

    assert_eq!(outcome.result, Settlement::Success(json!({"stopReason": "end_turn"})));

    let replies = read_replies(temp.path());
    assert_eq!(
        reply_for(&replies, "t1")["result"],
        json!({"echoed": {"msg": "hi"}})
    );
    assert_eq!(
        reply_for(&replies, "t2")["error"],
        json!({
            "code": -32603,
            "message": "Tool not available. Only these tools are available: echo, declared, boom"
        })
    );
    assert_eq!(
        reply_for(&replies, "t3")["error"]["message"],
        "Unknown tool: declared"
    );
    assert_eq!(reply_for(&replies, "t4")["error"]["message"], "kaboom");

    let statuses: Vec<(String, CallStatus)> = outcome
        .call_log
        .iter()
        .map(|r| (r.tool_name.clone(), r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("echo".to_owned(), CallStatus::Completed),
            ("declared".to_owned(), CallStatus::Failed),
            ("boom".to_owned(), CallStatus::Failed),
        ]
    );
    assert_eq!(outcome.recent_calls.len(), 2);
    assert_eq!(outcome.recent_calls[0].tool_name, "declared");

    let rejected = engine.rejected_call_log();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].attempted_tool, "ghost");
    assert_eq!(rejected[0].available_tools, vec!["echo", "declared", "boom"]);

    engine.stop();
}

#[tokio::test]
async fn prompt_carries_enriched_text_and_session_id() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.instruction = Some("Answer in one line.".to_owned());
    let (engine, _events) = AcpEngine::new(config).expect("engine");
    engine.declare_tool("read_file", "Read a file", json!({"type": "object"}));

    // Log the prompt request itself, then answer it.
    let script = peer_loop(&format!(
        r#"
    *'"method":"session/prompt"'*)
      printf '%s\n' "$line" >> replies.log
      {EXTRACT_ID}
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{}}}}\n' "$id"
      ;;"#
    ));
    engine
        .start(&scripted_peer(&script))
        .await
        .expect("session established");

    engine.send_prompt("What is in README?").await.expect("prompt");

    let replies = read_replies(temp.path());
    let prompt = replies
        .iter()
        .find(|r| r["method"] == "session/prompt")
        .expect("prompt request logged");
    assert_ne!(prompt["id"], 1, "id 1 is reserved for session/new");
    assert_eq!(prompt["params"]["sessionId"], "sess-1");
    assert_eq!(
        prompt["params"]["prompt"][0]["text"],
        "Answer in one line.\n\nAvailable tools:\n- read_file: Read a file\n  Input schema: {\"type\":\"object\"}\n\nWhat is in README?"
    );
    engine.stop();
}

#[tokio::test]
async fn initialize_from_peer_is_answered_with_tool_list() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (engine, mut events) = AcpEngine::new(test_config(temp.path())).expect("engine");
    engine.declare_tool("list_dir", "List a directory", json!({}));

    let script = format!(
        r#"
echo 'banner: agent starting up'
echo '{{"jsonrpc":"2.0","id":0,"method":"initialize","params":{{}}}}'
echo 'agent ready' >&2
{}"#,
        peer_loop("")
    );
    engine
        .start(&scripted_peer(&script))
        .await
        .expect("session established");

    let stderr = wait_for_event(&mut events, |e| matches!(e, EngineEvent::Stderr { .. })).await;
    assert_eq!(
        stderr,
        EngineEvent::Stderr {
            text: "agent ready\n".to_owned()
        }
    );

    let init = wait_for_reply(temp.path(), 0).await;
    assert_eq!(init["result"]["tools"][0]["name"], "list_dir");
    assert_eq!(
        init["result"]["securityConfiguration"]["rejectionBehavior"],
        "strict"
    );
    assert_eq!(engine.stats().malformed_lines, 1, "banner line is counted");
    engine.stop();
}

#[tokio::test]
async fn audit_log_records_calls_and_session_lifecycle() {
    let temp = tempfile::tempdir().expect("tempdir");
    let audit_dir = temp.path().join("audit");
    let writer = Arc::new(JsonlAuditWriter::new(audit_dir).expect("audit writer"));
    let (engine, _events) = AcpEngine::with_audit(
        test_config(temp.path()),
        Some(Arc::clone(&writer) as Arc<dyn AuditLogger>),
    );
    register_tools(&engine);

    engine
        .process(
            "go",
            ProcessOptions {
                peer: Some(scripted_peer(&tool_calling_peer())),
                recent_window: None,
            },
        )
        .await
        .expect("outcome");
    engine.stop();

    let raw = fs::read_to_string(writer.session_path(engine.engine_id(), Some("sess-1")))
        .expect("session audit file");
    let lines: Vec<Value> = raw
        .lines()
        .map(|l| serde_json::from_str(l).expect("json"))
        .collect();
    assert!(lines
        .iter()
        .all(|l| l["engine_id"] == engine.engine_id() && l["session_id"] == "sess-1"));
    let types: Vec<AuditEventType> = lines
        .iter()
        .map(|l| serde_json::from_value(l["event_type"].clone()).expect("event type"))
        .collect();

    assert_eq!(types.first(), Some(&AuditEventType::SessionStart));
    assert_eq!(types.last(), Some(&AuditEventType::SessionStop));
    assert!(types.contains(&AuditEventType::ToolCompleted));
    assert!(types.contains(&AuditEventType::ToolRejected));
    assert_eq!(
        types
            .iter()
            .filter(|t| **t == AuditEventType::ToolFailed)
            .count(),
        2
    );
    assert_eq!(
        lines.last().map(|l| l["result_summary"].clone()),
        Some(json!("3 accepted (1 completed, 2 failed, 0 executing), 1 rejected"))
    );
    assert!(
        !writer.session_path(engine.engine_id(), None).exists(),
        "no tool traffic before the session was ready"
    );
}
