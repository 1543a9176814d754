use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::idempotency::key::CacheKey;
use crate::idempotency::storage::{ResponseStore, StoredResponse};

struct CacheEntry {
    response: StoredResponse,
    expires_at: DateTime<Utc>,
}

/// In-process response store with per-entry expiry.
///
/// Suitable for tests and single-instance deployments. Expired entries are
/// invisible to readers immediately and are reclaimed lazily or by
/// [`ExpirySweeper`].
pub struct InMemoryResponseStore {
    entries: DashMap<String, CacheEntry>,
    claims: DashMap<String, DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryResponseStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            claims: DashMap::new(),
            clock,
        }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Number of entries held, including ones that expired but were not yet reclaimed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops expired responses and claims, returning how many responses were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.claims.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

impl Default for InMemoryResponseStore {
    fn default() -> Self {
        Self::with_system_clock()
    }
}

#[async_trait]
impl ResponseStore for InMemoryResponseStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredResponse>> {
        let now = self.clock.now();

        let expired = match self.entries.get(key.as_str()) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.response.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries
                .remove_if(key.as_str(), |_, entry| entry.expires_at <= now);
        }

        Ok(None)
    }

    async fn put(&self, key: &CacheKey, response: &StoredResponse, ttl: Duration) -> Result<()> {
        let entry = CacheEntry {
            response: response.clone(),
            expires_at: self.expiry(ttl),
        };
        self.entries.insert(key.as_str().to_string(), entry);
        Ok(())
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn try_claim(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);

        let claimed = match self.claims.entry(key.as_str().to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() <= now {
                    occupied.insert(expires_at);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(expires_at);
                true
            }
        };

        Ok(claimed)
    }

    async fn release(&self, key: &CacheKey) -> Result<()> {
        self.claims.remove(key.as_str());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Background job that reclaims expired in-memory entries.
pub struct ExpirySweeper {
    store: Arc<InMemoryResponseStore>,
    interval_seconds: u64,
}

impl ExpirySweeper {
    pub fn new(store: Arc<InMemoryResponseStore>, interval_seconds: u64) -> Self {
        Self {
            store,
            interval_seconds,
        }
    }

    /// Runs the sweep once.
    pub fn run_once(&self) -> usize {
        self.store.purge_expired()
    }

    /// Starts the sweep in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(self.interval_seconds.max(1)));

            loop {
                interval.tick().await;

                let count = self.store.purge_expired();
                if count > 0 {
                    tracing::info!("Purged {} expired idempotency records", count);
                }
            }
        })
    }
}
