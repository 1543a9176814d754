use request_idempotency::api::{create_router, AppState};
use request_idempotency::config::{Settings, StoreBackend};
use request_idempotency::idempotency::{
    ExpirySweeper, HeaderPrincipalResolver, InMemoryResponseStore, RedisResponseStore,
    RequestGate, ResponseStore,
};
use request_idempotency::observability::{init_logging, init_metrics, LogConfig, LogFormat};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    init_logging(&LogConfig::new(
        settings.application.log_level.clone(),
        LogFormat::from(settings.application.log_format.as_str()),
    ));
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;
    let gate_config = settings.gate_config()?;

    let store: Arc<dyn ResponseStore> = match settings.idempotency.backend {
        StoreBackend::Redis => {
            info!("Connecting to Redis at {}...", settings.redis.url);
            let store = RedisResponseStore::open(&settings.redis.url)?;
            // The gate degrades per its failure policy; startup does not block on Redis.
            match store.ping().await {
                Ok(()) => info!("Redis connection established"),
                Err(e) => warn!("Redis unreachable at startup: {}", e),
            }
            Arc::new(store)
        }
        StoreBackend::Memory => {
            let store = Arc::new(InMemoryResponseStore::with_system_clock());
            ExpirySweeper::new(Arc::clone(&store), settings.idempotency.sweep_interval_seconds).start();
            info!("Using in-memory response store");
            store
        }
    };

    let gate = Arc::new(RequestGate::new(gate_config, store));
    let mut state = AppState::new(gate).with_metrics(metrics_handle);
    if let Some(header) = settings.actor_header()? {
        info!("Resolving principals from header {}", header);
        state = state.with_resolver(Arc::new(HeaderPrincipalResolver::new(header)));
    }

    let app = create_router(state);

    let bind_address = settings.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Listening on http://{}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
