use axum::{
    extract::{MatchedPath, Request},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::idempotency::{
    idempotency_middleware, ExtensionPrincipalResolver, IdempotencyLayerState, PrincipalResolver,
    RequestGate, StoreFailurePolicy,
};
use crate::observability::{get_metrics, HealthChecker, LatencyTimer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<RequestGate>,
    pub resolver: Arc<dyn PrincipalResolver>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub health_checker: Arc<HealthChecker>,
}

impl AppState {
    pub fn new(gate: Arc<RequestGate>) -> Self {
        let store_required = gate.config().failure_policy == StoreFailurePolicy::FailClosed;
        let health_checker = HealthChecker::new(gate.store()).with_store_required(store_required);

        Self {
            gate,
            resolver: Arc::new(ExtensionPrincipalResolver),
            metrics_handle: None,
            health_checker: Arc::new(health_checker),
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Replaces the default health checker.
    pub fn with_health_checker(mut self, checker: Arc<HealthChecker>) -> Self {
        self.health_checker = checker;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PrincipalResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// Creates the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    let idempotency = IdempotencyLayerState::new(Arc::clone(&state.gate))
        .with_resolver(Arc::clone(&state.resolver));

    let protected = Router::new()
        .route(
            "/api/test",
            get(handlers::retrieve_resource)
                .post(handlers::create_resource)
                .put(handlers::update_resource)
                .patch(handlers::patch_resource)
                .delete(handlers::delete_resource),
        )
        .route_layer(middleware::from_fn_with_state(idempotency, idempotency_middleware));

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/health/detailed", get(handlers::detailed_health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoint
        .route("/metrics", get(handlers::metrics_endpoint))
        .merge(protected)
        .route_layer(middleware::from_fn(track_http_metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

/// Records request count and latency per matched route.
async fn track_http_metrics(request: Request, next: Next) -> Response {
    let timer = LatencyTimer::new();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;

    get_metrics().record_http_request(&method, &path, response.status().as_u16(), timer.elapsed_ms());
    response
}
