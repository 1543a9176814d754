use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::api::responses::{
    ApiResponse, DetailedHealthResponse, HealthResponse, MessageResponse, ServiceHealth,
};

use super::routes::AppState;

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let store = state.health_checker.check_store().await;
    let store_healthy = !store.status.is_unhealthy();

    let response = HealthResponse {
        status: if store_healthy { "healthy".to_string() } else { "degraded".to_string() },
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        services: ServiceHealth {
            store_backend: store.name,
            store: store_healthy,
        },
    };

    Json(ApiResponse::success(response))
}

/// Store health plus gate counters.
pub async fn detailed_health_check(
    State(state): State<AppState>,
) -> Json<ApiResponse<DetailedHealthResponse>> {
    let health = state.health_checker.check_all().await;
    let gate = state.gate.stats().snapshot();

    Json(ApiResponse::success(DetailedHealthResponse {
        health,
        replay_rate: gate.replay_rate(),
        gate,
    }))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

// ============================================================================
// Demo resource
// ============================================================================

pub async fn retrieve_resource() -> Json<MessageResponse> {
    Json(MessageResponse::new("retrieved"))
}

pub async fn create_resource() -> Json<MessageResponse> {
    Json(MessageResponse::new("success"))
}

pub async fn update_resource() -> Json<MessageResponse> {
    Json(MessageResponse::new("updated"))
}

pub async fn patch_resource() -> Json<MessageResponse> {
    Json(MessageResponse::new("patched"))
}

pub async fn delete_resource() -> Json<MessageResponse> {
    Json(MessageResponse::new("deleted"))
}
