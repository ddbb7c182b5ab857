//! Unit tests for the request correlator.
//!
//! Covers id assignment, exactly-once settlement, the timeout sentinel, and
//! the response-versus-timer race.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use acp_toolhost::acp::correlator::{Correlator, Settlement};
use acp_toolhost::acp::message::RpcError;
use acp_toolhost::AppError;

#[test]
fn next_id_starts_at_one_and_strictly_increases() {
    let correlator = Correlator::new();

    let ids: Vec<u64> = (0..100).map(|_| correlator.next_id()).collect();

    assert_eq!(ids[0], 1);
    assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));
}

#[tokio::test]
async fn response_settles_waiter_with_result() {
    let correlator = Arc::new(Correlator::new());
    let rx = correlator
        .register(1, Duration::from_secs(5))
        .expect("register");

    assert!(correlator.settle(1, Settlement::Success(json!({"sessionId": "s"}))));

    let settlement = rx.await.expect("settled");
    assert_eq!(settlement.result(), Some(&json!({"sessionId": "s"})));
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn error_response_settles_as_failure() {
    let correlator = Arc::new(Correlator::new());
    let rx = correlator
        .register(2, Duration::from_secs(5))
        .expect("register");

    let error = RpcError {
        code: -32000,
        message: "nope".to_owned(),
        data: None,
    };
    correlator.settle(2, Settlement::Failure(error.clone()));

    assert_eq!(rx.await.expect("settled"), Settlement::Failure(error));
}

#[tokio::test]
async fn second_settlement_is_a_no_op() {
    let correlator = Arc::new(Correlator::new());
    let rx = correlator
        .register(3, Duration::from_secs(5))
        .expect("register");

    assert!(correlator.settle(3, Settlement::Success(json!(1))));
    assert!(!correlator.settle(3, Settlement::Success(json!(2))));
    assert!(!correlator.settle(3, Settlement::TimedOut));

    assert_eq!(rx.await.expect("settled"), Settlement::Success(json!(1)));
}

#[tokio::test]
async fn unknown_id_is_ignored() {
    let correlator = Arc::new(Correlator::new());
    assert!(!correlator.settle(42, Settlement::Success(json!(null))));
}

#[tokio::test(start_paused = true)]
async fn timer_settles_with_timeout_sentinel() {
    let correlator = Arc::new(Correlator::new());
    let rx = correlator
        .register(4, Duration::from_millis(50))
        .expect("register");

    let settlement = rx.await.expect("settled by timer");

    assert!(settlement.is_timed_out());
    assert!(!correlator.is_pending(4));
}

#[tokio::test(start_paused = true)]
async fn late_response_after_timeout_is_ignored() {
    let correlator = Arc::new(Correlator::new());
    let rx = correlator
        .register(5, Duration::from_millis(10))
        .expect("register");

    assert_eq!(rx.await.expect("settled"), Settlement::TimedOut);
    assert!(!correlator.settle(5, Settlement::Success(json!("late"))));
}

#[tokio::test(start_paused = true)]
async fn response_cancels_timer() {
    let correlator = Arc::new(Correlator::new());
    let rx = correlator
        .register(6, Duration::from_millis(10))
        .expect("register");

    correlator.settle(6, Settlement::Success(json!("first")));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(rx.await.expect("settled"), Settlement::Success(json!("first")));
}

/// Response and timer racing on the same id settle it exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn response_and_timer_race_settles_once() {
    for round in 0..50_u64 {
        let correlator = Arc::new(Correlator::new());
        let rx = correlator
            .register(round, Duration::from_millis(1))
            .expect("register");

        let racer = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                correlator.settle(round, Settlement::Success(json!(round)))
            })
        };

        let settlement = rx.await.expect("settled exactly once");
        let response_won = racer.await.expect("racer joined");

        match settlement {
            Settlement::Success(_) => assert!(response_won),
            Settlement::TimedOut => assert!(!response_won),
            Settlement::Failure(err) => panic!("unexpected failure: {err:?}"),
        }
        assert_eq!(correlator.pending_count(), 0);
    }
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let correlator = Arc::new(Correlator::new());
    let _rx = correlator
        .register(7, Duration::from_secs(5))
        .expect("first register");

    let result = correlator.register(7, Duration::from_secs(5));

    assert!(matches!(result, Err(AppError::Acp(_))));
    assert_eq!(correlator.pending_count(), 1);
}

#[tokio::test]
async fn discard_closes_waiter_without_value() {
    let correlator = Arc::new(Correlator::new());
    let rx = correlator
        .register(8, Duration::from_secs(5))
        .expect("register");

    assert!(correlator.discard(8));
    assert!(rx.await.is_err());
    assert!(!correlator.discard(8));
}

#[test]
fn settlement_serializes_with_status_tag() {
    let ok = serde_json::to_value(Settlement::Success(json!({"stopReason": "end_turn"})))
        .expect("serialize");
    assert_eq!(ok, json!({"status": "success", "value": {"stopReason": "end_turn"}}));

    let timed_out = serde_json::to_value(Settlement::TimedOut).expect("serialize");
    assert_eq!(timed_out, json!({"status": "timed_out"}));
}
