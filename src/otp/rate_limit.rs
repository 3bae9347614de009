use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::clock::Clock;
use crate::config::RateLimits;

#[derive(Debug)]
struct RateLimitEntry {
    attempts: u32,
    window_start: DateTime<Utc>,
}

/// Fixed-window limiter keyed by an arbitrary string (the claimed email).
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    attempts: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_attempts: config.max_attempts,
            window: config.window(),
            clock,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Records an attempt for `key`; `false` once the window's budget is spent.
    pub async fn check_rate_limit(&self, key: &str) -> bool {
        let mut attempts = self.attempts.lock().await;
        let now = self.clock.now();

        // Clean up old entries
        attempts.retain(|_, entry| now - entry.window_start < self.window);

        match attempts.get_mut(key) {
            Some(entry) if entry.attempts >= self.max_attempts => {
                warn!(key, "Rate limit exceeded");
                false
            }
            Some(entry) => {
                entry.attempts += 1;
                true
            }
            None => {
                attempts.insert(
                    key.to_string(),
                    RateLimitEntry {
                        attempts: 1,
                        window_start: now,
                    },
                );
                true
            }
        }
    }

    pub async fn reset_rate_limit(&self, key: &str) {
        self.attempts.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_rate_limit() {
        let clock = Arc::new(ManualClock::default());
        let limiter = RateLimiter::new(
            &RateLimits {
                max_attempts: 3,
                window_secs: 60,
            },
            clock.clone(),
        );

        let key = "a@x.com";

        // First three attempts should succeed
        assert!(limiter.check_rate_limit(key).await);
        assert!(limiter.check_rate_limit(key).await);
        assert!(limiter.check_rate_limit(key).await);

        // Fourth attempt should fail
        assert!(!limiter.check_rate_limit(key).await);

        // Other keys are unaffected
        assert!(limiter.check_rate_limit("b@x.com").await);

        // Reset should allow new attempts
        limiter.reset_rate_limit(key).await;
        assert!(limiter.check_rate_limit(key).await);
    }

    #[tokio::test]
    async fn window_expiry_restores_the_budget() {
        let clock = Arc::new(ManualClock::default());
        let limiter = RateLimiter::new(
            &RateLimits {
                max_attempts: 1,
                window_secs: 60,
            },
            clock.clone(),
        );

        assert!(limiter.check_rate_limit("a@x.com").await);
        assert!(!limiter.check_rate_limit("a@x.com").await);

        clock.advance(Duration::seconds(60));
        assert!(limiter.check_rate_limit("a@x.com").await);
    }
}
