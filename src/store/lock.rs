//! Distributed mutex
//!
//! A lock is a store key holding a random owner token with a short expiry.
//! Acquisition polls with a jittered delay until a deadline; release deletes
//! the key only if the token still matches, so a holder whose lock already
//! expired cannot free somebody else's.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use super::CacheStore;
use crate::error::{Error, Result};

/// Default lock expiry
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(3);

/// Default time spent trying to acquire
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_RETRY_DELAY_MS: u64 = 50;
const MAX_RETRY_DELAY_MS: u64 = 250;

/// Lock factory bound to a store
#[derive(Clone)]
pub struct DistributedMutex {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    acquire_timeout: Duration,
}

impl DistributedMutex {
    /// Create a mutex factory with default expiry and timeout
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_LOCK_TTL,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Set the lock expiry
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set how long [`lock`](Self::lock) keeps trying
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Acquire the lock named `name`
    ///
    /// Returns [`Error::LockTimeout`] if it is still held by someone else
    /// when the acquire timeout elapses.
    pub async fn lock(&self, name: &str) -> Result<MutexGuard> {
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.acquire_timeout;

        loop {
            if self.store.try_lock(name, &token, self.ttl).await? {
                tracing::trace!(lock = name, "Lock acquired");
                return Ok(MutexGuard {
                    store: Arc::clone(&self.store),
                    name: name.to_string(),
                    token,
                    released: false,
                });
            }

            let delay = Duration::from_millis(
                rand::rng().random_range(MIN_RETRY_DELAY_MS..MAX_RETRY_DELAY_MS),
            );
            if Instant::now() + delay >= deadline {
                return Err(Error::LockTimeout(name.to_string()));
            }
            tokio::time::sleep(delay).await;
        }
    }
}

/// Held lock
///
/// Call [`unlock`](Self::unlock) to release it. A guard dropped without
/// unlocking frees the lock in a background task.
pub struct MutexGuard {
    store: Arc<dyn CacheStore>,
    name: String,
    token: String,
    released: bool,
}

impl MutexGuard {
    /// Lock key
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock
    ///
    /// Returns `false` if it had already expired and been taken over.
    pub async fn unlock(mut self) -> Result<bool> {
        self.released = true;
        let released = self.store.unlock(&self.name, &self.token).await?;
        if !released {
            tracing::warn!(lock = %self.name, "Lock expired before release");
        }
        Ok(released)
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = Arc::clone(&self.store);
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.unlock(&name, &token).await {
                    tracing::warn!(lock = %name, error = %e, "Failed to release dropped lock");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let mutex = DistributedMutex::new(Arc::clone(&store))
            .acquire_timeout(Duration::from_millis(300));

        let guard = mutex.lock("mutex:a").await.unwrap();
        assert_eq!(guard.name(), "mutex:a");

        let second = mutex.lock("mutex:a").await;
        assert!(matches!(second, Err(Error::LockTimeout(_))));

        assert!(guard.unlock().await.unwrap());
        let again = mutex.lock("mutex:a").await.unwrap();
        assert!(again.unlock().await.unwrap());
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let mutex = DistributedMutex::new(store);

        let guard = mutex.lock("mutex:b").await.unwrap();
        let waiter = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.lock("mutex:b").await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        guard.unlock().await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert!(second.unlock().await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_not_released_by_old_holder() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let mutex = DistributedMutex::new(Arc::clone(&store)).ttl(Duration::from_millis(20));

        let stale = mutex.lock("mutex:c").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let fresh = mutex.lock("mutex:c").await.unwrap();
        assert!(!stale.unlock().await.unwrap());
        assert!(fresh.unlock().await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let mutex = DistributedMutex::new(Arc::clone(&store));

        drop(mutex.lock("mutex:d").await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!store.exists("mutex:d").await.unwrap());
    }
}
