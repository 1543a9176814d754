use axum::body::{Body, Bytes, HttpBody};
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::{IdempotencyError, Result};
use crate::idempotency::key::{normalize_method, CacheKey, KeyDeriver, KeyDeriverConfig};
use crate::idempotency::principal::Principal;
use crate::idempotency::storage::{ResponseStore, StoredResponse};
use crate::idempotency::token::{IdempotencyToken, TokenPolicy, TokenValidator};
use crate::observability::{get_metrics, mask_key, LatencyTimer};

/// Default header carrying the client token (`X-Idempotency-Key`).
pub const DEFAULT_HEADER_NAME: HeaderName = HeaderName::from_static("x-idempotency-key");

/// Set on responses served from the store.
pub const REPLAY_HEADER: HeaderName = HeaderName::from_static("x-idempotency-replayed");

pub const DEFAULT_TTL_SECONDS: u64 = 86400;

pub const DEFAULT_ENFORCED_METHODS: [&str; 4] = ["POST", "PUT", "PATCH", "DELETE"];

/// Largest response body buffered for storage (1 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// What to do when the response store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Forward the request and skip persistence.
    #[default]
    FailOpen,
    /// Answer 503 instead of forwarding.
    FailClosed,
}

/// Handling of concurrent submissions that share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// Duplicates that both miss the store both reach the handler.
    #[default]
    Racy,
    /// A claim marker is taken before forwarding; a losing duplicate gets the
    /// stored response if one landed, otherwise 409.
    Exclusive,
}

/// Immutable configuration of a [`RequestGate`].
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub header_name: HeaderName,
    /// Uppercase method names subject to deduplication.
    pub enforced_methods: BTreeSet<String>,
    pub ttl: Duration,
    pub key: KeyDeriverConfig,
    pub token: TokenPolicy,
    /// Budget for each individual store call.
    pub store_timeout: Duration,
    pub failure_policy: StoreFailurePolicy,
    pub concurrency: ConcurrencyMode,
    /// Lifetime of the claim marker in exclusive mode.
    pub lock_ttl: Duration,
    /// Bodies larger than this, or of unknown length, are passed through unstored.
    pub max_body_size: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            header_name: DEFAULT_HEADER_NAME,
            enforced_methods: DEFAULT_ENFORCED_METHODS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            ttl: Duration::from_secs(DEFAULT_TTL_SECONDS),
            key: KeyDeriverConfig::default(),
            token: TokenPolicy::default(),
            store_timeout: Duration::from_millis(1000),
            failure_policy: StoreFailurePolicy::FailOpen,
            concurrency: ConcurrencyMode::Racy,
            lock_ttl: Duration::from_secs(30),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl GateConfig {
    pub fn with_header_name(mut self, header_name: HeaderName) -> Self {
        self.header_name = header_name;
        self
    }

    pub fn with_enforced_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.enforced_methods = methods.into_iter().map(|m| normalize_method(&m)).collect();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_key_config(mut self, key: KeyDeriverConfig) -> Self {
        self.key = key;
        self
    }

    pub fn with_token_policy(mut self, token: TokenPolicy) -> Self {
        self.token = token;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_concurrency(mut self, mode: ConcurrencyMode, lock_ttl: Duration) -> Self {
        self.concurrency = mode;
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn is_enforced(&self, method: &Method) -> bool {
        self.enforced_methods.contains(&normalize_method(method))
    }
}

/// Terminal state reached by a request passing through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Bypassed,
    Rejected,
    Replayed,
    Forwarded,
    Conflict,
    Unavailable,
}

impl GateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateOutcome::Bypassed => "bypassed",
            GateOutcome::Rejected => "rejected",
            GateOutcome::Replayed => "replayed",
            GateOutcome::Forwarded => "forwarded",
            GateOutcome::Conflict => "conflict",
            GateOutcome::Unavailable => "unavailable",
        }
    }
}

/// Counters for a single gate instance.
#[derive(Debug, Default)]
pub struct GateStats {
    pub total_requests: AtomicU64,
    pub bypassed_requests: AtomicU64,
    pub rejected_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub forwarded_requests: AtomicU64,
    pub conflicted_requests: AtomicU64,
    pub unavailable_requests: AtomicU64,
    pub stored_responses: AtomicU64,
    pub store_errors: AtomicU64,
}

impl GateStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: GateOutcome) {
        let counter = match outcome {
            GateOutcome::Bypassed => &self.bypassed_requests,
            GateOutcome::Rejected => &self.rejected_requests,
            GateOutcome::Replayed => &self.replayed_requests,
            GateOutcome::Forwarded => &self.forwarded_requests,
            GateOutcome::Conflict => &self.conflicted_requests,
            GateOutcome::Unavailable => &self.unavailable_requests,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self) {
        self.stored_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GateStatsSnapshot {
        GateStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            bypassed_requests: self.bypassed_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            forwarded_requests: self.forwarded_requests.load(Ordering::Relaxed),
            conflicted_requests: self.conflicted_requests.load(Ordering::Relaxed),
            unavailable_requests: self.unavailable_requests.load(Ordering::Relaxed),
            stored_responses: self.stored_responses.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStatsSnapshot {
    pub total_requests: u64,
    pub bypassed_requests: u64,
    pub rejected_requests: u64,
    pub replayed_requests: u64,
    pub forwarded_requests: u64,
    pub conflicted_requests: u64,
    pub unavailable_requests: u64,
    pub stored_responses: u64,
    pub store_errors: u64,
}

impl GateStatsSnapshot {
    /// Share of enforced requests answered from the store.
    pub fn replay_rate(&self) -> f64 {
        let enforced = self.total_requests.saturating_sub(self.bypassed_requests);
        if enforced == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / enforced as f64
        }
    }
}

/// True for 2xx responses declaring a JSON body.
pub fn is_storable(status: StatusCode, headers: &HeaderMap) -> bool {
    status.is_success() && has_json_content_type(headers)
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn has_json_content_type(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let essence = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    essence == "application/json" || (essence.starts_with("application/") && essence.ends_with("+json"))
}

/// Deduplicates mutating requests in front of a downstream handler.
pub struct RequestGate {
    config: GateConfig,
    store: Arc<dyn ResponseStore>,
    validator: TokenValidator,
    deriver: KeyDeriver,
    clock: Arc<dyn Clock>,
    stats: Arc<GateStats>,
}

impl RequestGate {
    pub fn new(config: GateConfig, store: Arc<dyn ResponseStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(config: GateConfig, store: Arc<dyn ResponseStore>, clock: Arc<dyn Clock>) -> Self {
        let validator = TokenValidator::new(config.token, Arc::clone(&clock));
        let deriver = KeyDeriver::new(config.key.clone());

        Self {
            config,
            store,
            validator,
            deriver,
            clock,
            stats: Arc::new(GateStats::new()),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ResponseStore> {
        Arc::clone(&self.store)
    }

    pub fn stats(&self) -> Arc<GateStats> {
        Arc::clone(&self.stats)
    }

    pub fn derive_key(&self, token: &IdempotencyToken, method: &Method, principal: &Principal) -> CacheKey {
        self.deriver.derive(token, method, principal)
    }

    /// Runs one request through the gate.
    ///
    /// `next` is the protected handler. It runs at most once, and not at all
    /// when the gate answers on its own.
    pub async fn process<F, Fut>(&self, request: Request, principal: &Principal, next: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        self.stats.record_request();
        let method = request.method().clone();
        let method_label = normalize_method(&method);

        if !self.config.is_enforced(&method) {
            self.finish(&method_label, GateOutcome::Bypassed);
            return next(request).await;
        }

        let header = request.headers().get(&self.config.header_name);
        let token = match self.validator.validate_header(header) {
            Ok(token) => token,
            Err(rejection) => {
                tracing::debug!(method = %method_label, reason = %rejection, "Rejected idempotency header");
                self.finish(&method_label, GateOutcome::Rejected);
                return IdempotencyError::InvalidToken(rejection).into_response();
            }
        };

        let key = self.deriver.derive(&token, &method, principal);

        match self.lookup(&key).await {
            Ok(Some((status, body))) => return self.replay(&method_label, &key, status, body),
            Ok(None) => {}
            Err(e) => {
                if self.config.failure_policy == StoreFailurePolicy::FailClosed {
                    self.finish(&method_label, GateOutcome::Unavailable);
                    return e.into_response();
                }
            }
        }

        let claimed = match self.config.concurrency {
            ConcurrencyMode::Racy => false,
            ConcurrencyMode::Exclusive => {
                match self
                    .call_store("claim", self.store.try_claim(&key, self.config.lock_ttl))
                    .await
                {
                    Ok(true) => {
                        // The first lookup may predate a holder that finished and released.
                        match self.lookup(&key).await {
                            Ok(None) => true,
                            Ok(Some((status, body))) => {
                                self.release_claim(&key).await;
                                return self.replay(&method_label, &key, status, body);
                            }
                            Err(e) => {
                                if self.config.failure_policy == StoreFailurePolicy::FailClosed {
                                    self.release_claim(&key).await;
                                    self.finish(&method_label, GateOutcome::Unavailable);
                                    return e.into_response();
                                }
                                true
                            }
                        }
                    }
                    Ok(false) => return self.resolve_contended(&method_label, &key).await,
                    Err(e) => {
                        if self.config.failure_policy == StoreFailurePolicy::FailClosed {
                            self.finish(&method_label, GateOutcome::Unavailable);
                            return e.into_response();
                        }
                        false
                    }
                }
            }
        };

        let response = next(request).await;
        self.finish(&method_label, GateOutcome::Forwarded);

        let response = self.persist(&key, response).await;

        if claimed {
            self.release_claim(&key).await;
        }

        response
    }

    async fn release_claim(&self, key: &CacheKey) {
        self.call_store("release", self.store.release(key)).await.ok();
    }

    /// Reads the stored response for `key`. Records with an unusable status
    /// count as misses.
    async fn lookup(&self, key: &CacheKey) -> std::result::Result<Option<(StatusCode, serde_json::Value)>, IdempotencyError> {
        let stored = self.call_store("get", self.store.get(key)).await?;

        Ok(stored.and_then(|stored| match stored.status_code() {
            Some(status) => Some((status, stored.response)),
            None => {
                tracing::warn!(key = %mask_key(key.as_str()), status = stored.status, "Ignoring stored response with invalid status");
                None
            }
        }))
    }

    fn replay(&self, method_label: &str, key: &CacheKey, status: StatusCode, body: serde_json::Value) -> Response {
        tracing::debug!(key = %mask_key(key.as_str()), status = status.as_u16(), "Replaying stored response");
        self.finish(method_label, GateOutcome::Replayed);

        (
            status,
            [(REPLAY_HEADER, HeaderValue::from_static("true"))],
            Json(body),
        )
            .into_response()
    }

    /// Another request holds the claim for `key`.
    async fn resolve_contended(&self, method_label: &str, key: &CacheKey) -> Response {
        if let Ok(Some((status, body))) = self.lookup(key).await {
            return self.replay(method_label, key, status, body);
        }

        tracing::info!(key = %mask_key(key.as_str()), "Duplicate request while original is in flight");
        self.finish(method_label, GateOutcome::Conflict);
        IdempotencyError::InProgress.into_response()
    }

    /// Applies the storage policy to a downstream response and hands it back.
    async fn persist(&self, key: &CacheKey, response: Response) -> Response {
        if !is_storable(response.status(), response.headers()) {
            tracing::debug!(
                key = %mask_key(key.as_str()),
                status = response.status().as_u16(),
                "Response not eligible for replay"
            );
            return response;
        }

        let limit = self.config.max_body_size;
        if declared_length(response.headers()).is_some_and(|len| len > limit as u64) {
            tracing::debug!(key = %mask_key(key.as_str()), limit, "Response body over size limit; not stored");
            return response;
        }

        let (parts, body) = response.into_parts();
        match body.size_hint().upper() {
            Some(upper) if upper <= limit as u64 => {}
            upper => {
                tracing::debug!(
                    key = %mask_key(key.as_str()),
                    limit,
                    size = ?upper,
                    "Response body over size limit or unbounded; not stored"
                );
                return Response::from_parts(parts, body);
            }
        }

        let bytes = match axum::body::to_bytes(body, limit).await {
            Ok(bytes) => bytes,
            Err(e) => {
                // Surface the failure on the body stream, as the handler's body would have.
                tracing::warn!(key = %mask_key(key.as_str()), error = %e, "Failed to buffer downstream response body");
                let failed = stream::once(async move { Err::<Bytes, _>(e) });
                return Response::from_parts(parts, Body::from_stream(failed));
            }
        };

        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value) => {
                let stored = StoredResponse::new(parts.status, value, self.clock.now());
                let written = self
                    .call_store("put", self.store.put(key, &stored, self.config.ttl))
                    .await;
                if written.is_ok() {
                    self.stats.record_stored();
                    get_metrics().record_response_stored(stored.status);
                }
            }
            Err(e) => {
                tracing::debug!(key = %mask_key(key.as_str()), error = %e, "JSON response body did not parse; not stored");
            }
        }

        Response::from_parts(parts, Body::from(bytes))
    }

    /// Runs a store call under the configured timeout. Timeouts and backend
    /// errors both come back as `StoreUnavailable`.
    async fn call_store<T, Fut>(&self, operation: &'static str, call: Fut) -> std::result::Result<T, IdempotencyError>
    where
        Fut: Future<Output = Result<T>>,
    {
        let timer = LatencyTimer::new();

        let result = match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(IdempotencyError::StoreUnavailable(e.to_string())),
            Err(_) => Err(IdempotencyError::StoreUnavailable(format!(
                "{} timed out after {}ms",
                operation,
                self.config.store_timeout.as_millis()
            ))),
        };

        get_metrics().record_store_operation(operation, timer.elapsed_ms(), result.is_ok());
        if let Err(e) = &result {
            self.stats.record_store_error();
            tracing::warn!(
                operation,
                backend = self.store.backend(),
                error = %e,
                "Idempotency store call failed"
            );
        }

        result
    }

    fn finish(&self, method_label: &str, outcome: GateOutcome) {
        self.stats.record_outcome(outcome);
        get_metrics().record_gate_outcome(method_label, outcome.as_str());
    }
}
