use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use super::{EphemeralStore, StoreError};

/// Redis-backed ephemeral store. Expiry is enforced by Redis via `PSETEX`.
#[derive(Clone)]
pub struct RedisEphemeralStore {
    connection: ConnectionManager,
}

impl RedisEphemeralStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let connection = ConnectionManager::new(client).await.map_err(unavailable)?;
        info!("Connected to Redis ephemeral store");
        Ok(Self { connection })
    }
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Whole milliseconds of `ttl`, rounded down so an entry never outlives
/// the requested lifetime.
fn ttl_millis(ttl: Duration) -> Option<u64> {
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    (millis > 0).then_some(millis)
}

#[async_trait]
impl EphemeralStore for RedisEphemeralStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let millis = ttl_millis(ttl).ok_or(StoreError::AlreadyExpired)?;
        let mut conn = self.connection.clone();
        redis::cmd("PSETEX")
            .arg(key)
            .arg(millis)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        conn.get::<_, Option<String>>(key).await.map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await.map_err(unavailable)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        conn.exists::<_, bool>(key).await.map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_down_to_whole_milliseconds() {
        assert_eq!(ttl_millis(Duration::from_micros(1_999)), Some(1));
        assert_eq!(ttl_millis(Duration::from_secs(86_400)), Some(86_400_000));
        assert_eq!(ttl_millis(Duration::from_micros(999)), None);
        assert_eq!(ttl_millis(Duration::ZERO), None);
    }
}
