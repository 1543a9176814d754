use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

use crate::idempotency::gate::RequestGate;
use crate::idempotency::principal::{ExtensionPrincipalResolver, PrincipalResolver};

/// State shared by every invocation of [`idempotency_middleware`].
#[derive(Clone)]
pub struct IdempotencyLayerState {
    pub gate: Arc<RequestGate>,
    pub resolver: Arc<dyn PrincipalResolver>,
}

impl IdempotencyLayerState {
    /// Principals come from request extensions.
    pub fn new(gate: Arc<RequestGate>) -> Self {
        Self {
            gate,
            resolver: Arc::new(ExtensionPrincipalResolver),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PrincipalResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// Axum middleware wrapping a handler with the request gate.
///
/// ```ignore
/// let state = IdempotencyLayerState::new(gate);
/// Router::new()
///     .route("/orders", post(create_order))
///     .layer(middleware::from_fn_with_state(state, idempotency_middleware));
/// ```
pub async fn idempotency_middleware(
    State(state): State<IdempotencyLayerState>,
    request: Request,
    next: Next,
) -> Response {
    let principal = state.resolver.resolve(&request);
    state
        .gate
        .process(request, &principal, |request| next.run(request))
        .await
}
