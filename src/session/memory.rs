use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::{EphemeralStore, StoreError};
use crate::clock::Clock;

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// In-process ephemeral store.
///
/// Entries are checked against the shared clock on every read, so an entry
/// is unreadable from the instant its TTL elapses even if it has not been
/// purged yet. Suitable for single-instance deployments and tests.
#[derive(Clone)]
pub struct InMemoryEphemeralStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEphemeralStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Remove expired entries, returning how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "Purged expired ephemeral entries");
        }
        purged
    }

    /// Number of entries physically held, expired or not.
    pub async fn stored_entries(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl EphemeralStore for InMemoryEphemeralStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if ttl <= chrono::Duration::zero() {
            return Err(StoreError::AlreadyExpired);
        }

        let expires_at = self.clock.now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        // Expired: drop it so the payload does not outlive its TTL in memory.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }
}
