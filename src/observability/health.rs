use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::idempotency::ResponseStore;

/// Store round trips slower than this report as degraded.
const STORE_LATENCY_BUDGET_MS: f64 = 50.0;

/// Health status of a service or dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Health status of a single dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    pub fn healthy(name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            latency_ms: None,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Aggregated health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = Self::aggregate_status(&dependencies);
        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }

    fn aggregate_status(dependencies: &[DependencyHealth]) -> HealthStatus {
        let has_unhealthy = dependencies.iter().any(|d| d.status.is_unhealthy());
        let has_degraded = dependencies.iter().any(|d| d.status.is_degraded());

        if has_unhealthy {
            HealthStatus::Unhealthy
        } else if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Health checker for the response store.
pub struct HealthChecker {
    store: Arc<dyn ResponseStore>,
    timeout: Duration,
    store_required: bool,
    start_time: std::time::Instant,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn ResponseStore>) -> Self {
        Self {
            store,
            timeout: Duration::from_secs(5),
            store_required: false,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Makes readiness depend on the store, for fail-closed deployments.
    pub fn with_store_required(mut self, required: bool) -> Self {
        self.store_required = required;
        self
    }

    /// Performs a full health check of all dependencies.
    pub async fn check_all(&self) -> AggregatedHealth {
        let dependencies = vec![self.check_store().await];

        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.start_time.elapsed().as_secs(),
            dependencies,
        )
    }

    /// Pings the response store.
    pub async fn check_store(&self) -> DependencyHealth {
        let name = self.store.backend();
        let start = std::time::Instant::now();

        match tokio::time::timeout(self.timeout, self.store.ping()).await {
            Ok(Ok(())) => {
                let latency = start.elapsed().as_secs_f64() * 1000.0;
                if latency > STORE_LATENCY_BUDGET_MS {
                    DependencyHealth {
                        name: name.to_string(),
                        status: HealthStatus::Degraded,
                        latency_ms: Some(latency),
                        message: Some("High latency detected".to_string()),
                    }
                } else {
                    DependencyHealth::healthy(name, latency)
                }
            }
            Ok(Err(e)) => DependencyHealth::unhealthy(name, format!("PING failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy(name, "PING timeout"),
        }
    }

    /// Liveness check - returns true if the service is alive.
    pub fn is_alive(&self) -> bool {
        true
    }

    /// Readiness check. A fail-open gate keeps serving without its store.
    pub async fn is_ready(&self) -> bool {
        if !self.store_required {
            return true;
        }
        !self.check_store().await.status.is_unhealthy()
    }

    /// Returns uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
