mod common;

use axum::http::{Method, StatusCode};
use common::{request, FlakyStore, TestApp, TOKEN};
use request_idempotency::clock::ManualClock;
use request_idempotency::idempotency::{ConcurrencyMode, GateConfig, StoreFailurePolicy};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn app_with_flaky_store(config: GateConfig) -> (TestApp, Arc<FlakyStore>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(FlakyStore::new(clock.clone()));
    let app = TestApp::with_store(config, store.clone(), clock);
    (app, store)
}

#[tokio::test]
async fn test_fail_open_forwards_when_store_is_down() {
    let (app, store) = app_with_flaky_store(GateConfig::default());
    store.set_down(true);

    let first = app.send(request(Method::POST, "/api/counter", Some(TOKEN))).await;
    let second = app.send(request(Method::POST, "/api/counter", Some(TOKEN))).await;

    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.json(), json!({"count": 1}));
    assert_eq!(second.json(), json!({"count": 2}));
    assert!(!second.is_replay());
    assert_eq!(app.calls(), 2);
    assert_eq!(app.gate.stats().snapshot().store_errors, 4);
}

#[tokio::test]
async fn test_fail_open_resumes_caching_after_recovery() {
    let (app, store) = app_with_flaky_store(GateConfig::default());

    store.set_down(true);
    app.send(request(Method::POST, "/api/counter", Some(TOKEN))).await;

    store.set_down(false);
    let second = app.send(request(Method::POST, "/api/counter", Some(TOKEN))).await;
    let third = app.send(request(Method::POST, "/api/counter", Some(TOKEN))).await;

    assert_eq!(second.json(), json!({"count": 2}));
    assert!(third.is_replay());
    assert_eq!(third.body, second.body);
    assert_eq!(app.calls(), 2);
}

#[tokio::test]
async fn test_failed_write_still_returns_handler_response() {
    let config = GateConfig::default().with_failure_policy(StoreFailurePolicy::FailClosed);
    let (app, store) = app_with_flaky_store(config);
    store.set_writes_down(true);

    let response = app.send(request(Method::POST, "/api/test", Some(TOKEN))).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json(), json!({"message": "success"}));
    assert_eq!(store.stored_entries(), 0);
    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn test_fail_closed_returns_503_when_lookup_fails() {
    let config = GateConfig::default().with_failure_policy(StoreFailurePolicy::FailClosed);
    let (app, store) = app_with_flaky_store(config);
    store.set_down(true);

    let response = app.send(request(Method::POST, "/api/test", Some(TOKEN))).await;

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json(), json!({"message": "idempotency store unavailable"}));
    assert_eq!(app.calls(), 0);
    assert_eq!(app.gate.stats().snapshot().unavailable_requests, 1);
}

#[tokio::test]
async fn test_fail_closed_still_bypasses_and_rejects() {
    let config = GateConfig::default().with_failure_policy(StoreFailurePolicy::FailClosed);
    let (app, store) = app_with_flaky_store(config);
    store.set_down(true);

    let get = app.send(request(Method::GET, "/api/test", None)).await;
    let missing = app.send(request(Method::POST, "/api/test", None)).await;

    assert_eq!(get.status, StatusCode::OK);
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn test_fail_closed_blocks_when_claim_fails() {
    let config = GateConfig::default()
        .with_failure_policy(StoreFailurePolicy::FailClosed)
        .with_concurrency(ConcurrencyMode::Exclusive, Duration::from_secs(30));
    let (app, store) = app_with_flaky_store(config);
    store.set_writes_down(true);

    let response = app.send(request(Method::POST, "/api/test", Some(TOKEN))).await;

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(app.calls(), 0);
}

#[tokio::test]
async fn test_fail_open_forwards_when_claim_fails() {
    let config = GateConfig::default()
        .with_concurrency(ConcurrencyMode::Exclusive, Duration::from_secs(30));
    let (app, store) = app_with_flaky_store(config);
    store.set_writes_down(true);

    let response = app.send(request(Method::POST, "/api/test", Some(TOKEN))).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(app.calls(), 1);
}
