use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use request_idempotency::idempotency::{
    GateConfig, GateStats, GateOutcome, InMemoryResponseStore, KeyDeriver, KeyDeriverConfig,
    KeyFormat, Principal, RequestGate, ResponseStore, StoredResponse, TokenValidator,
};

const TOKEN: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

fn benchmark_token_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("token");
    let validator = TokenValidator::with_default_policy();

    group.bench_function("valid_upper", |b| {
        b.iter(|| black_box(validator.validate(black_box(Some(TOKEN)))))
    });

    let lower = TOKEN.to_lowercase();
    group.bench_function("valid_lower", |b| {
        b.iter(|| black_box(validator.validate(black_box(Some(lower.as_str())))))
    });

    group.bench_function("invalid", |b| {
        b.iter(|| black_box(validator.validate(black_box(Some("invalid-key")))))
    });

    group.finish();
}

fn benchmark_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key");
    let token = TokenValidator::with_default_policy()
        .validate(Some(TOKEN))
        .expect("valid token");
    let principal = Principal::actor("user:42");

    for format in [KeyFormat::Plain, KeyFormat::Hashed] {
        let deriver = KeyDeriver::new(KeyDeriverConfig {
            key_prefix: "idempotency".to_string(),
            format,
        });
        group.bench_with_input(
            BenchmarkId::new("derive", format!("{:?}", format)),
            &deriver,
            |b, deriver| b.iter(|| black_box(deriver.derive(&token, &Method::POST, &principal))),
        );
    }

    group.finish();
}

fn benchmark_gate_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("gate_stats");

    group.bench_function("record_and_snapshot", |b| {
        let stats = GateStats::new();
        b.iter(|| {
            stats.record_request();
            stats.record_outcome(GateOutcome::Replayed);
            black_box(stats.snapshot().replay_rate())
        });
    });

    group.finish();
}

fn benchmark_in_memory_replay(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("replay");

    let store = Arc::new(InMemoryResponseStore::with_system_clock());
    let gate = RequestGate::new(GateConfig::default(), store.clone());
    let token = TokenValidator::with_default_policy()
        .validate(Some(TOKEN))
        .expect("valid token");
    let key = gate.derive_key(&token, &Method::POST, &Principal::Anonymous);

    runtime.block_on(async {
        let stored = StoredResponse::new(
            StatusCode::OK,
            json!({"message": "success", "items": [1, 2, 3]}),
            chrono::Utc::now(),
        );
        store
            .put(&key, &stored, Duration::from_secs(3600))
            .await
            .expect("in-memory put");
    });

    group.bench_function("store_get", |b| {
        b.to_async(&runtime).iter(|| async { black_box(store.get(&key).await) });
    });

    group.bench_function("gate_replay", |b| {
        b.to_async(&runtime).iter(|| async {
            let request = Request::builder()
                .method(Method::POST)
                .uri("/api/test")
                .header("x-idempotency-key", TOKEN)
                .body(Body::empty())
                .expect("request");
            let response = gate
                .process(request, &Principal::Anonymous, |_| async {
                    Json(json!({"message": "success"})).into_response()
                })
                .await;
            black_box(response)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_token_validation,
    benchmark_key_derivation,
    benchmark_gate_stats,
    benchmark_in_memory_replay,
);

criterion_main!(benches);
