//! Redis store adapter
//!
//! Uses one multiplexed [`ConnectionManager`], which reconnects on its own
//! and is cheap to clone per call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script, Value};

use super::scripts;
use super::{BucketParams, BucketState, CacheStore, HashLookup, PipelineOp, DEFAULT_CACHE_TTL};
use crate::error::{Error, Result};

/// [`CacheStore`] backed by Redis
pub struct RedisStore {
    conn: ConnectionManager,
    default_ttl: Duration,
    zpop_min_or_add: Script,
    hget_if_key_exists: Script,
    compare_and_delete: Script,
    token_bucket: Script,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Self::from_client(&client).await
    }

    /// Build a store on an existing client
    pub async fn from_client(client: &Client) -> Result<Self> {
        let conn = client.get_connection_manager().await?;
        tracing::info!("Connected to redis store");

        Ok(Self {
            conn,
            default_ttl: DEFAULT_CACHE_TTL,
            zpop_min_or_add: Script::new(scripts::ZPOP_MIN_OR_ADD_ONE),
            hget_if_key_exists: Script::new(scripts::HGET_IF_KEY_EXISTS),
            compare_and_delete: Script::new(scripts::COMPARE_AND_DELETE),
            token_bucket: Script::new(scripts::TOKEN_BUCKET),
        })
    }

    /// Set the expiry used by [`CacheStore::set`]
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.conn().get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let secs = self.default_ttl.as_secs().max(1);
        let _: () = self.conn().set_ex(key, value, secs).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _: () = self.conn().del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let exists: bool = self.conn().exists(key).await?;
        Ok(exists)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let value: Option<String> = self.conn().hget(key, field).await?;
        Ok(value)
    }

    async fn hget_if_key_exists(&self, key: &str, field: &str) -> Result<HashLookup> {
        let mut conn = self.conn();
        let reply: Value = self
            .hget_if_key_exists
            .key(key)
            .arg(field)
            .invoke_async(&mut conn)
            .await?;

        match reply {
            Value::Int(-1) => Ok(HashLookup::KeyMissing),
            Value::Int(0) => Ok(HashLookup::FieldMissing),
            Value::BulkString(bytes) => Ok(HashLookup::Found(
                String::from_utf8_lossy(&bytes).into_owned(),
            )),
            Value::SimpleString(s) => Ok(HashLookup::Found(s)),
            other => Err(Error::StoreReply(format!(
                "hget_if_key_exists on {}: {:?}",
                key, other
            ))),
        }
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn();
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let map: HashMap<String, String> = self.conn().hgetall(key).await?;
        Ok(map)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: () = self.conn().hset(key, field, value).await?;
        Ok(())
    }

    async fn hset_many(&self, key: &str, pairs: &[(String, String)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let _: () = self.conn().hset_multiple(key, pairs).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let _: () = self.conn().hdel(key, field).await?;
        Ok(())
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        let len: usize = self.conn().hlen(key).await?;
        Ok(len)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let _: () = self.conn().rpush(key, value).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let values: Vec<String> = self.conn().lrange(key, start, stop).await?;
        Ok(values)
    }

    async fn zpop_min_or_add(
        &self,
        key: &str,
        score: f64,
        member: &str,
    ) -> Result<Option<String>> {
        let mut conn = self.conn();
        let popped: String = self
            .zpop_min_or_add
            .key(key)
            .arg(score)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(if popped.is_empty() { None } else { Some(popped) })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let _: () = self.conn().zrem(key, member).await?;
        Ok(())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let score: Option<f64> = self.conn().zscore(key, member).await?;
        Ok(score)
    }

    async fn exec_pipeline(&self, ops: &[PipelineOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for op in ops {
            match op {
                PipelineOp::Delete { key } => {
                    pipe.del(key);
                }
                PipelineOp::HSetOne { key, field, value } => {
                    pipe.hset(key, field, value);
                }
                PipelineOp::RPush { key, value } => {
                    pipe.rpush(key, value);
                }
            }
        }

        // Collect every reply so a failed op can be reported by position
        pipe.ignore_errors();
        let mut conn = self.conn();
        let replies: Vec<Value> = pipe.query_async(&mut conn).await?;
        check_pipeline_replies(ops, &replies)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Value = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(!matches!(reply, Value::Nil))
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn();
        let released: i64 = self
            .compare_and_delete
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn take_tokens(
        &self,
        tokens_key: &str,
        ts_key: &str,
        params: &BucketParams,
        now_secs: i64,
    ) -> Result<BucketState> {
        let mut conn = self.conn();
        let (allowed, remaining): (i64, i64) = self
            .token_bucket
            .key(tokens_key)
            .key(ts_key)
            .arg(params.rate)
            .arg(params.capacity)
            .arg(now_secs)
            .arg(params.requested)
            .arg(params.ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketState {
            allowed: allowed == 1,
            remaining,
        })
    }
}

fn check_pipeline_replies(ops: &[PipelineOp], replies: &[Value]) -> Result<()> {
    if replies.len() != ops.len() {
        return Err(Error::StoreReply(format!(
            "pipeline returned {} replies for {} ops",
            replies.len(),
            ops.len()
        )));
    }

    for (index, (op, reply)) in ops.iter().zip(replies).enumerate() {
        if let Value::ServerError(e) = reply {
            let key = match op {
                PipelineOp::Delete { key }
                | PipelineOp::HSetOne { key, .. }
                | PipelineOp::RPush { key, .. } => key,
            };
            return Err(Error::StoreReply(format!(
                "pipeline op {} on {} failed: {}",
                index, key, e
            )));
        }
    }
    Ok(())
}
