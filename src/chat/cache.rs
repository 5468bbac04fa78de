//! Channel membership cache and presence
//!
//! Membership is read through a cache-aside hash at `rc:chanusers:<id>`.
//! A missing hash is a cache miss and is filled from the [`UserBackend`]
//! under a distributed mutex, so concurrent misses across nodes trigger a
//! single backend fetch. A present hash without the user is a definite
//! answer and never reaches the backend. A channel with no members is cached
//! as a hash holding only [`keys::EMPTY_CHANNEL_FIELD`].
//!
//! Online presence lives only in the cache (`rc:onlineusers:<id>`).

use std::sync::Arc;

use super::domain::parse_id;
use super::repo::{ChannelBackend, UserBackend};
use crate::error::{Error, Result};
use crate::store::keys;
use crate::store::lock::MutexGuard;
use crate::store::{CacheStore, DistributedMutex, HashLookup, PipelineOp};

/// Whether a user belongs to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Member,
    /// Channel exists, user is not in it
    NotMember,
    /// Channel does not exist
    ChannelNotFound,
}

/// Cache-aside view of channels, their members and who is online
#[derive(Clone)]
pub struct ChannelRegistry {
    cache: Arc<dyn CacheStore>,
    users: Arc<dyn UserBackend>,
    channels: Arc<dyn ChannelBackend>,
    mutex: DistributedMutex,
}

impl ChannelRegistry {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        users: Arc<dyn UserBackend>,
        channels: Arc<dyn ChannelBackend>,
    ) -> Self {
        let mutex = DistributedMutex::new(Arc::clone(&cache));
        Self {
            cache,
            users,
            channels,
            mutex,
        }
    }

    /// Use a differently configured mutex for cache fills
    pub fn with_mutex(mut self, mutex: DistributedMutex) -> Self {
        self.mutex = mutex;
        self
    }

    /// Add a member in the backend, then in the cache
    pub async fn add_user_to_channel(&self, channel_id: u64, user_id: u64) -> Result<()> {
        self.users.add_user_to_channel(channel_id, user_id).await?;
        self.cache
            .hset(&keys::channel_users(channel_id), &user_id.to_string(), "1")
            .await
    }

    /// Check membership, filling the cache from the backend on a miss
    pub async fn is_channel_user_exist(&self, channel_id: u64, user_id: u64) -> Result<Membership> {
        let key = keys::channel_users(channel_id);
        let field = user_id.to_string();

        if let Some(membership) = self.cached_membership(&key, &field).await? {
            return Ok(membership);
        }

        let guard = self.mutex.lock(&keys::mutex(&key)).await?;
        let result = self.fill_membership(channel_id, user_id, &key, &field).await;
        release(guard).await;
        result
    }

    async fn fill_membership(
        &self,
        channel_id: u64,
        user_id: u64,
        key: &str,
        field: &str,
    ) -> Result<Membership> {
        if let Some(membership) = self.cached_membership(key, field).await? {
            return Ok(membership);
        }

        let members = match self.users.get_channel_user_ids(channel_id).await {
            Ok(members) => members,
            Err(Error::ChannelNotFound(_)) => return Ok(Membership::ChannelNotFound),
            Err(e) => return Err(e),
        };
        tracing::debug!(
            channel_id = channel_id,
            members = members.len(),
            "Filled channel membership cache"
        );

        self.cache.hset_many(key, &member_pairs(&members)).await?;

        if members.contains(&user_id) {
            Ok(Membership::Member)
        } else {
            Ok(Membership::NotMember)
        }
    }

    async fn cached_membership(&self, key: &str, field: &str) -> Result<Option<Membership>> {
        Ok(match self.cache.hget_if_key_exists(key, field).await? {
            HashLookup::Found(_) => Some(Membership::Member),
            HashLookup::FieldMissing => Some(Membership::NotMember),
            HashLookup::KeyMissing => None,
        })
    }

    /// Members of a channel, filling the cache from the backend on a miss
    pub async fn get_channel_user_ids(&self, channel_id: u64) -> Result<Vec<u64>> {
        let key = keys::channel_users(channel_id);

        if let Some(cached) = self.cached_members(&key).await? {
            return Ok(cached);
        }

        let guard = self.mutex.lock(&keys::mutex(&key)).await?;
        let result = self.fill_members(channel_id, &key).await;
        release(guard).await;
        result
    }

    async fn fill_members(&self, channel_id: u64, key: &str) -> Result<Vec<u64>> {
        if let Some(cached) = self.cached_members(key).await? {
            return Ok(cached);
        }

        let members = self.users.get_channel_user_ids(channel_id).await?;
        self.cache.hset_many(key, &member_pairs(&members)).await?;
        Ok(members)
    }

    /// Cached members, or `None` when the hash is missing
    async fn cached_members(&self, key: &str) -> Result<Option<Vec<u64>>> {
        let map = self.cache.hgetall(key).await?;
        if map.is_empty() {
            return Ok(None);
        }
        member_ids(map.keys()).map(Some)
    }

    pub async fn add_online_user(&self, channel_id: u64, user_id: u64) -> Result<()> {
        self.cache
            .hset(&keys::online_users(channel_id), &user_id.to_string(), "1")
            .await
    }

    pub async fn delete_online_user(&self, channel_id: u64, user_id: u64) -> Result<()> {
        self.cache
            .hdel(&keys::online_users(channel_id), &user_id.to_string())
            .await
    }

    pub async fn get_online_user_ids(&self, channel_id: u64) -> Result<Vec<u64>> {
        let map = self.cache.hgetall(&keys::online_users(channel_id)).await?;
        member_ids(map.keys())
    }

    /// Number of users online in a channel
    pub async fn online_user_count(&self, channel_id: u64) -> Result<usize> {
        self.cache.hlen(&keys::online_users(channel_id)).await
    }

    /// Delete a channel in the backend and drop its cached state
    pub async fn delete_channel(&self, channel_id: u64) -> Result<()> {
        self.channels.delete_channel(channel_id).await?;
        self.cache
            .exec_pipeline(&[
                PipelineOp::delete(keys::online_users(channel_id)),
                PipelineOp::delete(keys::channel_users(channel_id)),
            ])
            .await
    }
}

fn member_pairs(members: &[u64]) -> Vec<(String, String)> {
    if members.is_empty() {
        return vec![(keys::EMPTY_CHANNEL_FIELD.to_string(), "1".to_string())];
    }
    members
        .iter()
        .map(|id| (id.to_string(), "1".to_string()))
        .collect()
}

/// User ids among the fields of a members hash
pub(super) fn member_ids<'a, I>(fields: I) -> Result<Vec<u64>>
where
    I: IntoIterator<Item = &'a String>,
{
    fields
        .into_iter()
        .filter(|field| field.as_str() != keys::EMPTY_CHANNEL_FIELD)
        .map(|id| parse_id(id))
        .collect()
}

async fn release(guard: MutexGuard) {
    let name = guard.name().to_string();
    if let Err(e) = guard.unlock().await {
        tracing::warn!(lock = %name, error = %e, "Failed to release cache fill lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::chat::domain::User;
    use crate::store::MemoryStore;

    /// Backend that counts membership fetches and answers slowly
    #[derive(Default)]
    struct CountingBackend {
        channels: Mutex<HashMap<u64, Vec<u64>>>,
        fetches: AtomicUsize,
    }

    impl CountingBackend {
        fn with_channel(channel_id: u64, members: &[u64]) -> Self {
            let backend = Self::default();
            backend
                .channels
                .lock()
                .insert(channel_id, members.to_vec());
            backend
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UserBackend for CountingBackend {
        async fn create_user(&self, _user: &User) -> Result<()> {
            Ok(())
        }

        async fn get_user(&self, user_id: u64) -> Result<User> {
            Err(Error::UserNotFound(user_id))
        }

        async fn add_user_to_channel(&self, channel_id: u64, user_id: u64) -> Result<()> {
            self.channels
                .lock()
                .entry(channel_id)
                .or_default()
                .push(user_id);
            Ok(())
        }

        async fn get_channel_user_ids(&self, channel_id: u64) -> Result<Vec<u64>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.channels
                .lock()
                .get(&channel_id)
                .cloned()
                .ok_or(Error::ChannelNotFound(channel_id))
        }
    }

    #[async_trait]
    impl ChannelBackend for CountingBackend {
        async fn create_channel(&self, channel_id: u64) -> Result<()> {
            self.channels.lock().entry(channel_id).or_default();
            Ok(())
        }

        async fn channel_exists(&self, channel_id: u64) -> Result<bool> {
            Ok(self.channels.lock().contains_key(&channel_id))
        }

        async fn delete_channel(&self, channel_id: u64) -> Result<()> {
            self.channels.lock().remove(&channel_id);
            Ok(())
        }
    }

    fn registry(backend: Arc<CountingBackend>) -> ChannelRegistry {
        ChannelRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&backend) as Arc<dyn UserBackend>,
            backend,
        )
    }

    #[tokio::test]
    async fn test_negative_hit_skips_backend() {
        let backend = Arc::new(CountingBackend::with_channel(1, &[10, 11]));
        let registry = registry(Arc::clone(&backend));

        assert_eq!(
            registry.is_channel_user_exist(1, 10).await.unwrap(),
            Membership::Member
        );
        assert_eq!(backend.fetches(), 1);

        // Cached hash without the user is a definite "no"
        assert_eq!(
            registry.is_channel_user_exist(1, 99).await.unwrap(),
            Membership::NotMember
        );
        assert_eq!(
            registry.is_channel_user_exist(1, 11).await.unwrap(),
            Membership::Member
        );
        assert_eq!(backend.fetches(), 1);
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let backend = Arc::new(CountingBackend::default());
        let registry = registry(Arc::clone(&backend));

        assert_eq!(
            registry.is_channel_user_exist(7, 1).await.unwrap(),
            Membership::ChannelNotFound
        );
        assert!(matches!(
            registry.get_channel_user_ids(7).await,
            Err(Error::ChannelNotFound(7))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_fetch_once() {
        let backend = Arc::new(CountingBackend::with_channel(1, &[10, 11]));
        let registry = registry(Arc::clone(&backend));

        let mut handles = Vec::new();
        for user_id in [10, 11, 12, 10, 11, 12, 10, 11] {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.is_channel_user_exist(1, user_id).await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(backend.fetches(), 1);
    }

    #[tokio::test]
    async fn test_get_channel_user_ids_fills_cache() {
        let backend = Arc::new(CountingBackend::with_channel(1, &[10, 11]));
        let registry = registry(Arc::clone(&backend));

        let mut ids = registry.get_channel_user_ids(1).await.unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![10, 11]);

        registry.get_channel_user_ids(1).await.unwrap();
        assert_eq!(backend.fetches(), 1);
    }

    #[tokio::test]
    async fn test_empty_channel_is_cached() {
        let backend = Arc::new(CountingBackend::with_channel(1, &[]));
        let registry = registry(Arc::clone(&backend));

        for _ in 0..3 {
            assert_eq!(
                registry.is_channel_user_exist(1, 10).await.unwrap(),
                Membership::NotMember
            );
        }
        assert!(registry.get_channel_user_ids(1).await.unwrap().is_empty());
        assert_eq!(backend.fetches(), 1);

        registry.add_user_to_channel(1, 10).await.unwrap();
        assert_eq!(registry.get_channel_user_ids(1).await.unwrap(), vec![10]);
        assert_eq!(
            registry.is_channel_user_exist(1, 10).await.unwrap(),
            Membership::Member
        );
        assert_eq!(backend.fetches(), 1);
    }

    #[tokio::test]
    async fn test_add_user_updates_cache() {
        let backend = Arc::new(CountingBackend::with_channel(1, &[]));
        let registry = registry(Arc::clone(&backend));

        registry.add_user_to_channel(1, 10).await.unwrap();
        assert_eq!(
            registry.is_channel_user_exist(1, 10).await.unwrap(),
            Membership::Member
        );
        assert_eq!(backend.fetches(), 0);
    }

    #[tokio::test]
    async fn test_presence_and_delete() {
        let backend = Arc::new(CountingBackend::with_channel(1, &[10, 11]));
        let registry = registry(Arc::clone(&backend));

        registry.add_online_user(1, 10).await.unwrap();
        registry.add_online_user(1, 11).await.unwrap();
        registry.add_online_user(1, 11).await.unwrap();
        assert_eq!(registry.online_user_count(1).await.unwrap(), 2);

        registry.delete_online_user(1, 10).await.unwrap();
        assert_eq!(registry.get_online_user_ids(1).await.unwrap(), vec![11]);

        registry.is_channel_user_exist(1, 10).await.unwrap();
        registry.delete_channel(1).await.unwrap();

        assert_eq!(registry.online_user_count(1).await.unwrap(), 0);
        assert_eq!(
            registry.is_channel_user_exist(1, 10).await.unwrap(),
            Membership::ChannelNotFound
        );
    }
}
