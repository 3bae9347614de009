//! Ephemeral registration sessions.
//!
//! A pending signup lives only in the ephemeral store, keyed by its session
//! id, until its owner proves control of the claimed email address. The
//! backing store enforces expiry through a per-key TTL; this module adds a
//! typed layer on top that serialises records, derives the TTL from each
//! record's own `expires_at`, and never hands out a record past that instant.
//!
//! # Modules
//! - `memory`: clock-aware in-process TTL map
//! - `redis`: Redis-backed store for multi-instance deployments

pub mod memory;
pub mod redis;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{CredentialHash, ProfileFields};

pub use self::memory::InMemoryEphemeralStore;
pub use self::redis::RedisEphemeralStore;

/// Error types for ephemeral store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ephemeral store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode session record: {0}")]
    Encode(String),

    #[error("session record already expired")]
    AlreadyExpired,
}

/// Key/value store with per-key time-to-live.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Stores `value` under `key`; the entry must be gone once `ttl` elapses.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Address of a pending record in the ephemeral store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// `registration:<session id>`
    Registration(Uuid),
    /// `enterprise_registration:<account id>`
    Enterprise(Uuid),
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Registration(id) => write!(f, "registration:{id}"),
            SessionKey::Enterprise(id) => write!(f, "enterprise_registration:{id}"),
        }
    }
}

/// A record that carries its own hard expiry.
pub trait ExpiringRecord: Serialize + DeserializeOwned + Send + Sync {
    fn expires_at(&self) -> DateTime<Utc>;
}

/// A signup that has not yet been promised a durable identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationSession {
    /// Correlation id handed to the client; never reused.
    pub id: Uuid,
    pub email: String,
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(flatten)]
    pub profile: ProfileFields,
    /// Only copy of the credential until commit.
    pub credential: CredentialHash,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RegistrationSession {
    pub fn key(&self) -> SessionKey {
        SessionKey::Registration(self.id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl ExpiringRecord for RegistrationSession {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Typed access to pending records in an [`EphemeralStore`].
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn EphemeralStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Writes `record` with a TTL equal to the time left until its expiry.
    pub async fn save<T: ExpiringRecord>(&self, key: SessionKey, record: &T) -> Result<(), StoreError> {
        let ttl = (record.expires_at() - self.clock.now())
            .to_std()
            .map_err(|_| StoreError::AlreadyExpired)?;
        if ttl.is_zero() {
            return Err(StoreError::AlreadyExpired);
        }

        let value = serde_json::to_string(record).map_err(|e| StoreError::Encode(e.to_string()))?;
        self.store.put(&key.to_string(), value, ttl).await
    }

    /// Reads a record; expired and undecodable records read as absent.
    pub async fn load<T: ExpiringRecord>(&self, key: SessionKey) -> Result<Option<T>, StoreError> {
        let raw_key = key.to_string();
        let Some(raw) = self.store.get(&raw_key).await? else {
            return Ok(None);
        };

        let record: T = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                error!(key = %raw_key, "Discarding undecodable session record: {}", e);
                self.discard_quietly(key).await;
                return Ok(None);
            }
        };

        if record.expires_at() <= self.clock.now() {
            self.discard_quietly(key).await;
            return Ok(None);
        }

        Ok(Some(record))
    }

    pub async fn discard(&self, key: SessionKey) -> Result<(), StoreError> {
        self.store.delete(&key.to_string()).await
    }

    /// Deletes a record, logging instead of failing.
    pub async fn discard_quietly(&self, key: SessionKey) {
        if let Err(e) = self.discard(key).await {
            warn!(key = %key, "Failed to delete session record: {}", e);
        }
    }

    pub async fn contains(&self, key: SessionKey) -> Result<bool, StoreError> {
        self.store.exists(&key.to_string()).await
    }
}
