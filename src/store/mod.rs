//! Shared cache store
//!
//! Every gateway node talks to one shared key/value store. [`CacheStore`]
//! exposes the primitive operations the rest of the crate needs, including
//! the atomic procedures (pop-or-enqueue, conditional hash read, token bucket) and the
//! lock primitives behind [`DistributedMutex`].
//!
//! Two adapters are provided:
//!
//! - [`RedisStore`]: Redis via a multiplexed `ConnectionManager`, atomic
//!   procedures as Lua scripts
//! - [`MemoryStore`]: a single-process store for tests and local runs
//!
//! Values are plain strings; callers encode structured data as JSON.

pub mod keys;
pub mod lock;
pub mod memory;
pub mod ratelimit;
pub mod redis_store;
pub mod scripts;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use self::lock::DistributedMutex;
pub use self::memory::MemoryStore;
pub use self::ratelimit::RateLimiter;
pub use self::redis_store::RedisStore;

/// Default expiry applied by [`CacheStore::set`]
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of [`CacheStore::hget_if_key_exists`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashLookup {
    /// The hash itself does not exist (cache miss)
    KeyMissing,
    /// The hash exists but has no such field (negative hit)
    FieldMissing,
    /// The field value
    Found(String),
}

/// One operation of a pipelined batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOp {
    /// Delete a key
    Delete { key: String },
    /// Set one hash field
    HSetOne {
        key: String,
        field: String,
        value: String,
    },
    /// Append to a list
    RPush { key: String, value: String },
}

impl PipelineOp {
    pub fn delete(key: impl Into<String>) -> Self {
        PipelineOp::Delete { key: key.into() }
    }

    pub fn hset_one(
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        PipelineOp::HSetOne {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn rpush(key: impl Into<String>, value: impl Into<String>) -> Self {
        PipelineOp::RPush {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Token bucket shape and request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    /// Refill rate in tokens per second
    pub rate: f64,
    /// Bucket capacity (burst)
    pub capacity: u64,
    /// Tokens to take
    pub requested: u64,
    /// Expiry of the bucket state
    pub ttl: Duration,
}

/// Token bucket decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Whether the requested tokens were taken
    pub allowed: bool,
    /// Tokens left in the bucket
    pub remaining: i64,
}

/// Shared key/value store
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a string value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a string value with the store's default expiry
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key (no-op if absent)
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Get one hash field
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Atomically read a hash field, distinguishing a missing hash from a
    /// missing field
    async fn hget_if_key_exists(&self, key: &str, field: &str) -> Result<HashLookup>;

    /// Get several hash fields, in request order
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>>;

    /// Get a whole hash
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Set one hash field
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Set several hash fields at once (no-op for an empty slice)
    async fn hset_many(&self, key: &str, pairs: &[(String, String)]) -> Result<()>;

    /// Delete one hash field
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    /// Number of fields in a hash
    async fn hlen(&self, key: &str) -> Result<usize>;

    /// Append to a list
    async fn rpush(&self, key: &str, value: &str) -> Result<()>;

    /// List range with Redis index semantics (negative = from the tail)
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Atomically pop the minimum-score member of a sorted set, or add
    /// `member` with `score` if the set is empty.
    ///
    /// Returns the popped member. Returns `None` when `member` was enqueued
    /// or was already present (in which case nothing changes).
    async fn zpop_min_or_add(&self, key: &str, score: f64, member: &str)
        -> Result<Option<String>>;

    /// Remove a sorted set member (no-op if absent)
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;

    /// Score of a sorted set member
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;

    /// Execute a batch in one round trip; the first failing op is reported
    async fn exec_pipeline(&self, ops: &[PipelineOp]) -> Result<()>;

    /// Set `key` to `token` with expiry `ttl` only if absent
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it still holds `token`
    async fn unlock(&self, key: &str, token: &str) -> Result<bool>;

    /// Refill the bucket stored under `tokens_key`/`ts_key` and try to take
    /// `requested` tokens
    async fn take_tokens(
        &self,
        tokens_key: &str,
        ts_key: &str,
        params: &BucketParams,
        now_secs: i64,
    ) -> Result<BucketState>;
}
