//! Token bucket rate limiter shared across nodes

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{keys, BucketParams, CacheStore};
use crate::error::Result;

/// Rate limiter allowing `rate` events per second with bursts of `burst`
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CacheStore>,
    rate: f64,
    burst: u64,
    expiration: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CacheStore>, rate: f64, burst: u64, expiration: Duration) -> Self {
        Self {
            store,
            rate,
            burst,
            expiration,
        }
    }

    /// Take one token for `key`
    pub async fn allow(&self, key: &str) -> Result<bool> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.allow_n(key, now, 1).await
    }

    /// Take `n` tokens for `key` at time `now_secs`
    pub async fn allow_n(&self, key: &str, now_secs: i64, n: u64) -> Result<bool> {
        let (tokens_key, ts_key) = keys::rate_limit(key);
        let params = BucketParams {
            rate: self.rate,
            capacity: self.burst,
            requested: n,
            ttl: self.expiration,
        };

        let state = self
            .store
            .take_tokens(&tokens_key, &ts_key, &params, now_secs)
            .await?;

        if !state.allowed {
            tracing::debug!(key = key, remaining = state.remaining, "Rate limited");
        }
        Ok(state.allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_burst_then_refill() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store, 1.0, 3, Duration::from_secs(60));

        let now = 1_000;
        assert!(limiter.allow_n("u1", now, 1).await.unwrap());
        assert!(limiter.allow_n("u1", now, 1).await.unwrap());
        assert!(limiter.allow_n("u1", now, 1).await.unwrap());
        assert!(!limiter.allow_n("u1", now, 1).await.unwrap());

        // Other keys have their own bucket
        assert!(limiter.allow_n("u2", now, 3).await.unwrap());

        // Two seconds refill two tokens
        assert!(limiter.allow_n("u1", now + 2, 2).await.unwrap());
        assert!(!limiter.allow_n("u1", now + 2, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_refill_is_capped_at_burst() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store, 10.0, 2, Duration::from_secs(60));

        assert!(limiter.allow_n("u", 0, 2).await.unwrap());
        assert!(!limiter.allow_n("u", 100, 3).await.unwrap());
        assert!(limiter.allow_n("u", 100, 2).await.unwrap());
    }
}
