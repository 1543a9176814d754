#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderName, Method, Request, StatusCode},
    middleware,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use async_trait::async_trait;
use request_idempotency::clock::ManualClock;
use request_idempotency::error::{AppError, Result};
use request_idempotency::idempotency::{
    idempotency_middleware, CacheKey, GateConfig, HeaderPrincipalResolver, IdempotencyLayerState,
    InMemoryResponseStore, RequestGate, ResponseStore, StoredResponse,
};
use serde_json::{json, Value};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub const TOKEN: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
pub const OTHER_TOKEN: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
pub const ACTOR_HEADER: &str = "x-actor-id";
pub const SLOW_HANDLER_DELAY: Duration = Duration::from_millis(200);

/// Router with counting handlers behind the idempotency middleware.
pub struct TestApp {
    pub router: Router,
    pub gate: Arc<RequestGate>,
    pub clock: Arc<ManualClock>,
    pub calls: Arc<AtomicUsize>,
}

impl TestApp {
    pub fn new(config: GateConfig) -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryResponseStore::new(clock.clone()));
        Self::with_store(config, store, clock)
    }

    pub fn with_store(config: GateConfig, store: Arc<dyn ResponseStore>, clock: Arc<ManualClock>) -> Self {
        let gate = Arc::new(RequestGate::with_clock(config, store, clock.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        let state = IdempotencyLayerState::new(Arc::clone(&gate)).with_resolver(Arc::new(
            HeaderPrincipalResolver::new(HeaderName::from_static(ACTOR_HEADER)),
        ));

        let router = Router::new()
            .route(
                "/api/test",
                post(counted(&calls, || Json(json!({"message": "success"}))))
                    .put(counted(&calls, || Json(json!({"message": "updated"}))))
                    .patch(counted(&calls, || Json(json!({"message": "patched"}))))
                    .delete(counted(&calls, || Json(json!({"message": "deleted"}))))
                    .get(counted(&calls, || Json(json!({"message": "retrieved"})))),
            )
            .route(
                "/api/created",
                post(counted(&calls, || {
                    (StatusCode::CREATED, Json(json!({"id": 42, "status": "created", "amount": 10.5})))
                })),
            )
            .route(
                "/api/error",
                post(counted(&calls, || {
                    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "failed"})))
                })),
            )
            .route(
                "/api/invalid",
                post(counted(&calls, || {
                    (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"error": "invalid"})))
                })),
            )
            .route(
                "/api/html",
                post(counted(&calls, || {
                    (
                        [(CONTENT_TYPE, "text/html; charset=UTF-8")],
                        "<html><body>Hello</body></html>",
                    )
                })),
            )
            .route(
                "/api/broken-json",
                post(counted(&calls, || ([(CONTENT_TYPE, "application/json")], "{not json"))),
            )
            .route("/api/counter", post(counter(&calls)))
            .route("/api/slow", post(slow(&calls)))
            .layer(middleware::from_fn_with_state(state, idempotency_middleware));

        Self {
            router,
            gate,
            clock,
            calls,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        send(&self.router, request).await
    }
}

/// Handler that bumps the shared call counter before producing `respond()`.
fn counted<F, R>(
    calls: &Arc<AtomicUsize>,
    respond: F,
) -> impl Fn() -> std::future::Ready<axum::response::Response> + Clone + Send + Sync + 'static
where
    F: Fn() -> R + Clone + Send + Sync + 'static,
    R: IntoResponse,
{
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(respond().into_response())
    }
}

/// Handler whose body reports how many times it has run.
fn counter(
    calls: &Arc<AtomicUsize>,
) -> impl Fn() -> std::future::Ready<Json<Value>> + Clone + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
        let count = calls.fetch_add(1, Ordering::SeqCst) + 1;
        std::future::ready(Json(json!({"count": count})))
    }
}

type BoxedJson = Pin<Box<dyn Future<Output = Json<Value>> + Send>>;

/// Handler that takes a while, leaving room for a concurrent duplicate.
fn slow(calls: &Arc<AtomicUsize>) -> impl Fn() -> BoxedJson + Clone + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
        let calls = Arc::clone(&calls);
        Box::pin(async move {
            let count = calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(SLOW_HANDLER_DELAY).await;
            Json(json!({"count": count}))
        })
    }
}

/// In-memory store whose reads and writes can be switched off.
pub struct FlakyStore {
    inner: InMemoryResponseStore,
    reads_down: AtomicBool,
    writes_down: AtomicBool,
}

impl FlakyStore {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            inner: InMemoryResponseStore::new(clock),
            reads_down: AtomicBool::new(false),
            writes_down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.reads_down.store(down, Ordering::SeqCst);
        self.writes_down.store(down, Ordering::SeqCst);
    }

    pub fn set_writes_down(&self, down: bool) {
        self.writes_down.store(down, Ordering::SeqCst);
    }

    pub fn stored_entries(&self) -> usize {
        self.inner.len()
    }

    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(AppError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "store offline",
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ResponseStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredResponse>> {
        Self::check(&self.reads_down)?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &CacheKey, response: &StoredResponse, ttl: Duration) -> Result<()> {
        Self::check(&self.writes_down)?;
        self.inner.put(key, response, ttl).await
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        Self::check(&self.reads_down)?;
        self.inner.exists(key).await
    }

    async fn try_claim(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        Self::check(&self.writes_down)?;
        self.inner.try_claim(key, ttl).await
    }

    async fn release(&self, key: &CacheKey) -> Result<()> {
        Self::check(&self.writes_down)?;
        self.inner.release(key).await
    }

    async fn ping(&self) -> Result<()> {
        Self::check(&self.reads_down)
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("response body is not JSON")
    }

    pub fn is_replay(&self) -> bool {
        self.headers.contains_key("x-idempotency-replayed")
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router is infallible");

    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");

    TestResponse {
        status,
        headers,
        body,
    }
}

pub fn request(method: Method, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header("X-Idempotency-Key", token);
    }
    builder
        .body(Body::from(r#"{"data":"test"}"#))
        .expect("Failed to build request")
}

pub fn request_as(method: Method, uri: &str, token: &str, actor: &str) -> Request<Body> {
    let mut request = request(method, uri, Some(token));
    request.headers_mut().insert(
        ACTOR_HEADER,
        actor.parse().expect("actor id is a valid header value"),
    );
    request
}
