use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::StatusCode;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::idempotency::key::CacheKey;
use crate::observability::mask_key;

/// Response persisted for replay.
///
/// Serialized as `{"response": ..., "status": ..., "timestamp": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub response: serde_json::Value,
    pub status: u16,
    pub timestamp: DateTime<Utc>,
}

impl StoredResponse {
    pub fn new(status: StatusCode, response: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            response,
            status: status.as_u16(),
            timestamp,
        }
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status).ok()
    }
}

/// TTL-capable key-value backend holding replayable responses.
///
/// Implementations must be safe to share between concurrent requests and rely
/// on the backend's own atomic primitives. Expiry is enforced by the backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Short backend name used in logs and health output.
    fn backend(&self) -> &'static str;

    /// Returns the stored response, or `None` on a miss or after expiry.
    async fn get(&self, key: &CacheKey) -> Result<Option<StoredResponse>>;

    /// Writes `response` under `key`, replacing any previous entry.
    async fn put(&self, key: &CacheKey, response: &StoredResponse, ttl: Duration) -> Result<()>;

    async fn exists(&self, key: &CacheKey) -> Result<bool>;

    /// Atomically places an in-flight marker if none exists.
    /// Returns true when this caller now owns the marker.
    async fn try_claim(&self, key: &CacheKey, ttl: Duration) -> Result<bool>;

    /// Removes an in-flight marker.
    async fn release(&self, key: &CacheKey) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// Redis-backed response store.
pub struct RedisResponseStore {
    client: redis::Client,
}

impl RedisResponseStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(AppError::Redis)?;
        Ok(Self::new(client))
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }
}

/// Redis rejects `EX 0`; sub-second TTLs round up to one second.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl ResponseStore for RedisResponseStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredResponse>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key.as_str()).await.map_err(AppError::Redis)?;

        match value {
            Some(json) => match serde_json::from_str::<StoredResponse>(&json) {
                Ok(stored) => Ok(Some(stored)),
                Err(e) => {
                    tracing::warn!(key = %mask_key(key.as_str()), error = %e, "Discarding unreadable idempotency record");
                    if let Err(e) = conn.del::<_, ()>(key.as_str()).await {
                        tracing::warn!(key = %mask_key(key.as_str()), error = %e, "Redis del error");
                    }
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn put(&self, key: &CacheKey, response: &StoredResponse, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(response)?;
        let mut conn = self.connection().await?;
        let ttl = ttl_secs(ttl);

        conn.set_ex::<_, _, ()>(key.as_str(), json, ttl)
            .await
            .map_err(AppError::Redis)?;

        tracing::debug!(key = %mask_key(key.as_str()), ttl_secs = ttl, "Stored idempotent response");
        Ok(())
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        let mut conn = self.connection().await?;
        let exists: bool = conn.exists(key.as_str()).await.map_err(AppError::Redis)?;
        Ok(exists)
    }

    async fn try_claim(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let result: Option<String> = conn
            .set_options(
                key.claim_key().as_str(),
                "processing",
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::EX(ttl_secs(ttl) as usize)),
            )
            .await
            .map_err(AppError::Redis)?;

        Ok(result.is_some())
    }

    async fn release(&self, key: &CacheKey) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key.claim_key().as_str())
            .await
            .map_err(AppError::Redis)?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(AppError::Redis)?;
        Ok(())
    }
}
