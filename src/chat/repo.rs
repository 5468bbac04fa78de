//! Backing repositories for users, channels and messages
//!
//! These are the authoritative records. The [`ChannelRegistry`] caches
//! membership in front of them; message history is read straight through.
//!
//! [`StoreRepository`] implements all three traits on top of a
//! [`CacheStore`], which is how a single-store deployment runs.
//!
//! [`ChannelRegistry`]: super::cache::ChannelRegistry

use std::sync::Arc;

use async_trait::async_trait;

use super::cache::member_ids;
use super::domain::{Message, User};
use crate::error::{Error, Result};
use crate::store::keys;
use crate::store::{CacheStore, PipelineOp};

/// Default number of messages returned by [`MessageBackend::list_messages`]
pub const DEFAULT_MAX_MESSAGES: usize = 500;

/// User records and channel membership
#[async_trait]
pub trait UserBackend: Send + Sync {
    async fn create_user(&self, user: &User) -> Result<()>;

    /// Returns [`Error::UserNotFound`] for an unknown id
    async fn get_user(&self, user_id: u64) -> Result<User>;

    async fn add_user_to_channel(&self, channel_id: u64, user_id: u64) -> Result<()>;

    /// Members of a channel
    ///
    /// Returns [`Error::ChannelNotFound`] if the channel does not exist.
    async fn get_channel_user_ids(&self, channel_id: u64) -> Result<Vec<u64>>;
}

/// Channel records
#[async_trait]
pub trait ChannelBackend: Send + Sync {
    async fn create_channel(&self, channel_id: u64) -> Result<()>;

    async fn channel_exists(&self, channel_id: u64) -> Result<bool>;

    /// Delete the channel record and its membership
    async fn delete_channel(&self, channel_id: u64) -> Result<()>;
}

/// Message history
#[async_trait]
pub trait MessageBackend: Send + Sync {
    /// Append a message and record it as unseen
    async fn insert_message(&self, message: &Message) -> Result<()>;

    async fn mark_message_seen(&self, channel_id: u64, message_id: u64) -> Result<()>;

    /// Most recent messages of a channel, oldest first, with seen flags
    ///
    /// Returns [`Error::ChannelNotFound`] if the channel does not exist.
    async fn list_messages(&self, channel_id: u64) -> Result<Vec<Message>>;
}

/// Repositories over a shared [`CacheStore`]
#[derive(Clone)]
pub struct StoreRepository {
    store: Arc<dyn CacheStore>,
    max_messages: usize,
}

impl StoreRepository {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }

    /// Set how many recent messages are listed
    pub fn max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages.max(1);
        self
    }

    async fn ensure_channel(&self, channel_id: u64) -> Result<()> {
        if self.store.exists(&keys::channel(channel_id)).await? {
            Ok(())
        } else {
            Err(Error::ChannelNotFound(channel_id))
        }
    }
}

#[async_trait]
impl UserBackend for StoreRepository {
    async fn create_user(&self, user: &User) -> Result<()> {
        let data = serde_json::to_string(user)?;
        self.store.set(&keys::user(user.id), &data).await
    }

    async fn get_user(&self, user_id: u64) -> Result<User> {
        match self.store.get(&keys::user(user_id)).await? {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(Error::UserNotFound(user_id)),
        }
    }

    async fn add_user_to_channel(&self, channel_id: u64, user_id: u64) -> Result<()> {
        self.store
            .hset(&keys::channel_users(channel_id), &user_id.to_string(), "0")
            .await
    }

    async fn get_channel_user_ids(&self, channel_id: u64) -> Result<Vec<u64>> {
        self.ensure_channel(channel_id).await?;

        let members = self.store.hgetall(&keys::channel_users(channel_id)).await?;
        member_ids(members.keys())
    }
}

#[async_trait]
impl ChannelBackend for StoreRepository {
    async fn create_channel(&self, channel_id: u64) -> Result<()> {
        self.store.set(&keys::channel(channel_id), "0").await
    }

    async fn channel_exists(&self, channel_id: u64) -> Result<bool> {
        self.store.exists(&keys::channel(channel_id)).await
    }

    async fn delete_channel(&self, channel_id: u64) -> Result<()> {
        self.store
            .exec_pipeline(&[
                PipelineOp::delete(keys::channel(channel_id)),
                PipelineOp::delete(keys::channel_users(channel_id)),
            ])
            .await
    }
}

#[async_trait]
impl MessageBackend for StoreRepository {
    async fn insert_message(&self, message: &Message) -> Result<()> {
        let channel_id = message.channel_id;
        self.store
            .exec_pipeline(&[
                PipelineOp::rpush(keys::messages(channel_id), message.encode()?),
                PipelineOp::hset_one(
                    keys::seen_messages(channel_id),
                    message.message_id.to_string(),
                    "0",
                ),
            ])
            .await
    }

    async fn mark_message_seen(&self, channel_id: u64, message_id: u64) -> Result<()> {
        self.store
            .hset(
                &keys::seen_messages(channel_id),
                &message_id.to_string(),
                "1",
            )
            .await
    }

    async fn list_messages(&self, channel_id: u64) -> Result<Vec<Message>> {
        self.ensure_channel(channel_id).await?;

        let start = -(self.max_messages as isize);
        let raw = self
            .store
            .lrange(&keys::messages(channel_id), start, -1)
            .await?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let mut messages = Vec::with_capacity(raw.len());
        for entry in &raw {
            match Message::decode(entry.as_bytes()) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    tracing::warn!(channel_id = channel_id, error = %e, "Skipping undecodable message");
                }
            }
        }

        let ids: Vec<String> = messages.iter().map(|m| m.message_id.to_string()).collect();
        let flags = self
            .store
            .hmget(&keys::seen_messages(channel_id), &ids)
            .await?;
        for (msg, flag) in messages.iter_mut().zip(flags) {
            msg.seen = flag.as_deref() == Some("1");
        }

        Ok(messages)
    }
}
