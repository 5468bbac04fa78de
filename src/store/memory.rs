//! In-process store adapter
//!
//! Mirrors the Redis data types the crate uses. Every operation, including
//! the scripted ones, runs under one lock, which gives the same atomicity
//! as a server-side script.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BucketParams, BucketState, CacheStore, HashLookup, PipelineOp};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Entry {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
}

impl Entry {
    fn kind(&self) -> &'static str {
        match self {
            Entry::Str(_) => "string",
            Entry::Hash(_) => "hash",
            Entry::List(_) => "list",
            Entry::ZSet(_) => "zset",
        }
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    expiries: HashMap<String, Instant>,
}

impl State {
    fn purge_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expiries.get(key) {
            if *deadline <= Instant::now() {
                self.expiries.remove(key);
                self.entries.remove(key);
            }
        }
    }

    fn entry(&mut self, key: &str) -> Option<&Entry> {
        self.purge_expired(key);
        self.entries.get(key)
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.expiries.remove(key);
    }

    fn set_str(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        self.entries.insert(key.to_string(), Entry::Str(value));
        match ttl {
            Some(ttl) => {
                self.expiries.insert(key.to_string(), Instant::now() + ttl);
            }
            None => {
                self.expiries.remove(key);
            }
        }
    }

    fn get_str(&mut self, key: &str) -> Result<Option<String>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry::Str(s)) => Ok(Some(s.clone())),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    fn hash(&mut self, key: &str) -> Result<Option<&HashMap<String, String>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry::Hash(h)) => Ok(Some(h)),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>> {
        self.purge_expired(key);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry {
            Entry::Hash(h) => Ok(h),
            other => Err(wrong_type(key, other)),
        }
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut VecDeque<String>> {
        self.purge_expired(key);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()));
        match entry {
            Entry::List(l) => Ok(l),
            other => Err(wrong_type(key, other)),
        }
    }

    fn zset_mut(&mut self, key: &str) -> Result<&mut HashMap<String, f64>> {
        self.purge_expired(key);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::ZSet(HashMap::new()));
        match entry {
            Entry::ZSet(z) => Ok(z),
            other => Err(wrong_type(key, other)),
        }
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hash_mut(key)?
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn hdel(&mut self, key: &str, field: &str) -> Result<()> {
        let empty = match self.hash_mut(key) {
            Ok(h) => {
                h.remove(field);
                h.is_empty()
            }
            Err(e) => return Err(e),
        };
        // Redis drops a hash once its last field is gone
        if empty {
            self.remove(key);
        }
        Ok(())
    }

    fn rpush(&mut self, key: &str, value: &str) -> Result<()> {
        self.list_mut(key)?.push_back(value.to_string());
        Ok(())
    }
}

fn wrong_type(key: &str, entry: &Entry) -> Error {
    Error::StoreReply(format!(
        "WRONGTYPE key {} holds a {} value",
        key,
        entry.kind()
    ))
}

/// Resolve Redis-style `start`/`stop` list indices to a half-open range
fn list_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if start > stop || start >= len || stop < 0 {
        None
    } else {
        Some((start as usize, stop as usize + 1))
    }
}

/// [`CacheStore`] held in process memory
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    default_ttl: Option<Duration>,
}

impl MemoryStore {
    /// Create an empty store whose plain values never expire
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            default_ttl: None,
        }
    }

    /// Set the expiry used by [`CacheStore::set`]
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in &keys {
            state.purge_expired(key);
        }
        state.entries.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.state.lock().get_str(key)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .set_str(key, value.to_string(), self.default_ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock().entry(key).is_some())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        Ok(state.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    async fn hget_if_key_exists(&self, key: &str, field: &str) -> Result<HashLookup> {
        let mut state = self.state.lock();
        Ok(match state.hash(key)? {
            None => HashLookup::KeyMissing,
            Some(h) => match h.get(field) {
                Some(v) => HashLookup::Found(v.clone()),
                None => HashLookup::FieldMissing,
            },
        })
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let mut state = self.state.lock();
        let hash = state.hash(key)?;
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f).cloned()))
            .collect())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut state = self.state.lock();
        Ok(state.hash(key)?.cloned().unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.state.lock().hset(key, field, value)
    }

    async fn hset_many(&self, key: &str, pairs: &[(String, String)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let hash = state.hash_mut(key)?;
        for (field, value) in pairs {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.entry(key).is_none() {
            return Ok(());
        }
        state.hdel(key, field)
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        let mut state = self.state.lock();
        Ok(state.hash(key)?.map(|h| h.len()).unwrap_or(0))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        self.state.lock().rpush(key, value)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        let list = match state.entry(key) {
            None => return Ok(Vec::new()),
            Some(Entry::List(l)) => l,
            Some(other) => return Err(wrong_type(key, other)),
        };

        Ok(match list_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn zpop_min_or_add(
        &self,
        key: &str,
        score: f64,
        member: &str,
    ) -> Result<Option<String>> {
        let mut state = self.state.lock();
        let zset = state.zset_mut(key)?;

        if zset.contains_key(member) {
            return Ok(None);
        }

        // Lowest score first, ties broken by member like a Redis sorted set
        let min = zset
            .iter()
            .min_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(m, _)| m.clone());

        match min {
            Some(peer) => {
                zset.remove(&peer);
                if zset.is_empty() {
                    state.remove(key);
                }
                Ok(Some(peer))
            }
            None => {
                zset.insert(member.to_string(), score);
                Ok(None)
            }
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.entry(key).is_none() {
            return Ok(());
        }
        let zset = state.zset_mut(key)?;
        zset.remove(member);
        if zset.is_empty() {
            state.remove(key);
        }
        Ok(())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut state = self.state.lock();
        match state.entry(key) {
            None => Ok(None),
            Some(Entry::ZSet(z)) => Ok(z.get(member).copied()),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn exec_pipeline(&self, ops: &[PipelineOp]) -> Result<()> {
        let mut state = self.state.lock();
        for op in ops {
            match op {
                PipelineOp::Delete { key } => state.remove(key),
                PipelineOp::HSetOne { key, field, value } => state.hset(key, field, value)?,
                PipelineOp::RPush { key, value } => state.rpush(key, value)?,
            }
        }
        Ok(())
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if state.entry(key).is_some() {
            return Ok(false);
        }
        state.set_str(key, token.to_string(), Some(ttl));
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.get_str(key)? {
            Some(current) if current == token => {
                state.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn take_tokens(
        &self,
        tokens_key: &str,
        ts_key: &str,
        params: &BucketParams,
        now_secs: i64,
    ) -> Result<BucketState> {
        let mut state = self.state.lock();
        let capacity = params.capacity as f64;

        let last_tokens = state
            .get_str(tokens_key)?
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(capacity);
        let last_refreshed = state
            .get_str(ts_key)?
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);

        let delta = (now_secs - last_refreshed).max(0) as f64;
        let filled = capacity.min(last_tokens + delta * params.rate);
        let requested = params.requested as f64;
        let allowed = filled >= requested;
        let remaining = if allowed { filled - requested } else { filled };

        let ttl = Some(params.ttl.max(Duration::from_secs(1)));
        state.set_str(tokens_key, remaining.to_string(), ttl);
        state.set_str(ts_key, now_secs.to_string(), ttl);

        Ok(BucketState {
            allowed,
            remaining: remaining.floor() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_range() {
        assert_eq!(list_range(5, 0, -1), Some((0, 5)));
        assert_eq!(list_range(5, -2, -1), Some((3, 5)));
        assert_eq!(list_range(5, -500, -1), Some((0, 5)));
        assert_eq!(list_range(5, 1, 2), Some((1, 3)));
        assert_eq!(list_range(5, 3, 1), None);
        assert_eq!(list_range(0, 0, -1), None);
        assert_eq!(list_range(5, 7, 9), None);
    }

    #[tokio::test]
    async fn test_zpop_min_or_add() {
        let store = MemoryStore::new();

        // Empty set: caller is enqueued
        assert_eq!(store.zpop_min_or_add("wait", 10.0, "a").await.unwrap(), None);
        assert_eq!(store.zscore("wait", "a").await.unwrap(), Some(10.0));

        // Caller already waiting: no change
        assert_eq!(store.zpop_min_or_add("wait", 11.0, "a").await.unwrap(), None);
        assert_eq!(store.zscore("wait", "a").await.unwrap(), Some(10.0));

        // Another caller pops the waiting one and is not enqueued
        assert_eq!(
            store.zpop_min_or_add("wait", 12.0, "b").await.unwrap(),
            Some("a".to_string())
        );
        assert_eq!(store.zscore("wait", "b").await.unwrap(), None);
        assert!(!store.exists("wait").await.unwrap());
    }

    #[tokio::test]
    async fn test_zpop_prefers_earliest_then_member_order() {
        let store = MemoryStore::new();
        {
            let mut state = store.state.lock();
            let zset = state.zset_mut("wait").unwrap();
            zset.insert("9".into(), 5.0);
            zset.insert("3".into(), 5.0);
            zset.insert("1".into(), 7.0);
        }

        assert_eq!(
            store.zpop_min_or_add("wait", 8.0, "x").await.unwrap(),
            Some("3".to_string())
        );
        assert_eq!(
            store.zpop_min_or_add("wait", 8.0, "x").await.unwrap(),
            Some("9".to_string())
        );
    }

    #[tokio::test]
    async fn test_hget_if_key_exists() {
        let store = MemoryStore::new();

        assert_eq!(
            store.hget_if_key_exists("h", "f").await.unwrap(),
            HashLookup::KeyMissing
        );

        store.hset("h", "g", "1").await.unwrap();
        assert_eq!(
            store.hget_if_key_exists("h", "f").await.unwrap(),
            HashLookup::FieldMissing
        );
        assert_eq!(
            store.hget_if_key_exists("h", "g").await.unwrap(),
            HashLookup::Found("1".to_string())
        );

        // Removing the last field removes the hash
        store.hdel("h", "g").await.unwrap();
        assert_eq!(
            store.hget_if_key_exists("h", "g").await.unwrap(),
            HashLookup::KeyMissing
        );
    }

    #[tokio::test]
    async fn test_pipeline_and_lists() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();

        store
            .exec_pipeline(&[
                PipelineOp::rpush("l", "m1"),
                PipelineOp::rpush("l", "m2"),
                PipelineOp::hset_one("seen", "1", "0"),
                PipelineOp::delete("k"),
            ])
            .await
            .unwrap();

        assert_eq!(store.lrange("l", -500, -1).await.unwrap(), vec!["m1", "m2"]);
        assert_eq!(store.hget("seen", "1").await.unwrap().as_deref(), Some("0"));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();

        assert!(matches!(
            store.hset("k", "f", "v").await,
            Err(Error::StoreReply(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(20);

        assert!(store.try_lock("mutex:x", "t1", ttl).await.unwrap());
        assert!(!store.try_lock("mutex:x", "t2", ttl).await.unwrap());
        assert!(!store.unlock("mutex:x", "t2").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.try_lock("mutex:x", "t2", ttl).await.unwrap());
        assert!(store.unlock("mutex:x", "t2").await.unwrap());
    }

    #[tokio::test]
    async fn test_hmget_preserves_order() {
        let store = MemoryStore::new();
        store
            .hset_many("h", &[("a".into(), "1".into()), ("c".into(), "3".into())])
            .await
            .unwrap();

        let fields = vec!["c".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(
            store.hmget("h", &fields).await.unwrap(),
            vec![Some("3".to_string()), None, Some("1".to_string())]
        );
        assert_eq!(store.hlen("h").await.unwrap(), 2);
    }
}
