//! Chat services
//!
//! [`UserService`], [`ChannelService`] and [`MessageService`] wrap the
//! repositories and the [`ChannelRegistry`] with id generation, token
//! minting and publishing. Failures carry the operation as context.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use super::cache::{ChannelRegistry, Membership};
use super::domain::{Action, Channel, Event, Message, User};
use super::repo::{ChannelBackend, MessageBackend, UserBackend};
use crate::auth::TokenSigner;
use crate::error::{Error, Result, ResultExt};
use crate::fanout::topic::MESSAGE_TOPIC;
use crate::fanout::Broker;
use crate::idgen::IdGenerator;
use crate::matching::{ChannelCreator, MembershipWriter, UserDirectory};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Users and channel membership
#[derive(Clone)]
pub struct UserService {
    users: Arc<dyn UserBackend>,
    registry: ChannelRegistry,
    ids: Arc<IdGenerator>,
}

impl UserService {
    pub fn new(
        users: Arc<dyn UserBackend>,
        registry: ChannelRegistry,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            users,
            registry,
            ids,
        }
    }

    /// Register a user under a fresh id
    pub async fn create_user(&self, name: &str) -> Result<User> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("user name must not be empty".into()));
        }

        let user = User {
            id: self.ids.next_id().context("create user id")?,
            name: name.to_string(),
        };
        self.users
            .create_user(&user)
            .await
            .context(format!("create user {}", user.id))?;

        tracing::info!(user_id = user.id, "User created");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: u64) -> Result<User> {
        self.users
            .get_user(user_id)
            .await
            .context(format!("get user {}", user_id))
    }

    pub async fn add_user_to_channel(&self, channel_id: u64, user_id: u64) -> Result<()> {
        self.registry
            .add_user_to_channel(channel_id, user_id)
            .await
            .context(format!("add user {} to channel {}", user_id, channel_id))
    }

    pub async fn is_channel_user_exist(&self, channel_id: u64, user_id: u64) -> Result<Membership> {
        self.registry
            .is_channel_user_exist(channel_id, user_id)
            .await
            .context(format!("check user {} in channel {}", user_id, channel_id))
    }

    pub async fn get_channel_user_ids(&self, channel_id: u64) -> Result<Vec<u64>> {
        self.registry
            .get_channel_user_ids(channel_id)
            .await
            .context(format!("get users in channel {}", channel_id))
    }

    pub async fn add_online_user(&self, channel_id: u64, user_id: u64) -> Result<()> {
        self.registry
            .add_online_user(channel_id, user_id)
            .await
            .context(format!("add online user {} to channel {}", user_id, channel_id))
    }

    pub async fn delete_online_user(&self, channel_id: u64, user_id: u64) -> Result<()> {
        self.registry
            .delete_online_user(channel_id, user_id)
            .await
            .context(format!(
                "delete online user {} from channel {}",
                user_id, channel_id
            ))
    }

    pub async fn get_online_user_ids(&self, channel_id: u64) -> Result<Vec<u64>> {
        self.registry
            .get_online_user_ids(channel_id)
            .await
            .context(format!("get online users in channel {}", channel_id))
    }
}

#[async_trait]
impl UserDirectory for UserService {
    async fn get_user(&self, user_id: u64) -> Result<User> {
        UserService::get_user(self, user_id).await
    }
}

#[async_trait]
impl MembershipWriter for UserService {
    async fn add_user_to_channel(&self, channel_id: u64, user_id: u64) -> Result<()> {
        UserService::add_user_to_channel(self, channel_id, user_id).await
    }
}

/// Channel lifecycle
#[derive(Clone)]
pub struct ChannelService {
    channels: Arc<dyn ChannelBackend>,
    registry: ChannelRegistry,
    ids: Arc<IdGenerator>,
    signer: Arc<TokenSigner>,
}

impl ChannelService {
    pub fn new(
        channels: Arc<dyn ChannelBackend>,
        registry: ChannelRegistry,
        ids: Arc<IdGenerator>,
        signer: Arc<TokenSigner>,
    ) -> Self {
        Self {
            channels,
            registry,
            ids,
            signer,
        }
    }

    /// Create a channel and an access token for it
    pub async fn create_channel(&self) -> Result<Channel> {
        let channel_id = self.ids.next_id().context("create channel id")?;
        self.channels
            .create_channel(channel_id)
            .await
            .context(format!("create channel {}", channel_id))?;

        let access_token = self.signer.issue(channel_id)?;
        tracing::debug!(channel_id = channel_id, "Channel created");

        Ok(Channel {
            id: channel_id,
            access_token,
        })
    }

    /// Delete a channel with its membership and presence
    pub async fn delete_channel(&self, channel_id: u64) -> Result<()> {
        self.registry
            .delete_channel(channel_id)
            .await
            .context(format!("delete channel {}", channel_id))?;

        tracing::info!(channel_id = channel_id, "Channel deleted");
        Ok(())
    }
}

#[async_trait]
impl ChannelCreator for ChannelService {
    async fn create_channel(&self) -> Result<Channel> {
        ChannelService::create_channel(self).await
    }
}

/// Message history and publishing
#[derive(Clone)]
pub struct MessageService {
    messages: Arc<dyn MessageBackend>,
    registry: ChannelRegistry,
    broker: Arc<dyn Broker>,
    ids: Arc<IdGenerator>,
}

impl MessageService {
    pub fn new(
        messages: Arc<dyn MessageBackend>,
        registry: ChannelRegistry,
        broker: Arc<dyn Broker>,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            messages,
            registry,
            broker,
            ids,
        }
    }

    fn new_message(
        &self,
        event: Event,
        channel_id: u64,
        user_id: u64,
        payload: String,
    ) -> Result<Message> {
        Ok(Message {
            message_id: self.ids.next_id().context("create message id")?,
            event,
            channel_id,
            user_id,
            payload,
            seen: false,
            time: now_millis(),
        })
    }

    /// Store and publish a text message
    pub async fn broadcast_text_message(
        &self,
        channel_id: u64,
        user_id: u64,
        payload: &str,
    ) -> Result<Message> {
        let msg = self.new_message(Event::Text, channel_id, user_id, payload.to_string())?;
        self.insert_message(&msg)
            .await
            .context("broadcast text message")?;
        self.publish_message(&msg)
            .await
            .context("broadcast text message")?;
        Ok(msg)
    }

    /// Store and publish a file message; the payload is the file URL
    pub async fn broadcast_file_message(
        &self,
        channel_id: u64,
        user_id: u64,
        payload: &str,
    ) -> Result<Message> {
        let msg = self.new_message(Event::File, channel_id, user_id, payload.to_string())?;
        self.insert_message(&msg)
            .await
            .context("broadcast file message")?;
        self.publish_message(&msg)
            .await
            .context("broadcast file message")?;
        Ok(msg)
    }

    /// Publish a presence or typing signal; actions are not stored
    pub async fn broadcast_action_message(
        &self,
        channel_id: u64,
        user_id: u64,
        action: Action,
    ) -> Result<Message> {
        let msg = self.new_message(Event::Action, channel_id, user_id, action.to_string())?;
        self.publish_message(&msg)
            .await
            .context("broadcast action message")?;
        Ok(msg)
    }

    /// Announce a user that just came online
    ///
    /// The first user online gets `waiting`, anyone after that `joined`.
    /// Two users connecting at the same moment may both see `joined`.
    pub async fn broadcast_connect_message(&self, channel_id: u64, user_id: u64) -> Result<Message> {
        let online = self
            .registry
            .online_user_count(channel_id)
            .await
            .context(format!("get online users in channel {}", channel_id))?;

        let action = if online == 1 {
            Action::Waiting
        } else {
            Action::Joined
        };
        self.broadcast_action_message(channel_id, user_id, action)
            .await
    }

    /// Mark a message as seen and tell the channel
    ///
    /// The published event carries the seen message id as its payload.
    pub async fn mark_message_seen(
        &self,
        channel_id: u64,
        user_id: u64,
        message_id: u64,
    ) -> Result<Message> {
        let context = || format!("mark message {} seen in channel {}", message_id, channel_id);

        self.messages
            .mark_message_seen(channel_id, message_id)
            .await
            .context(context())?;

        let mut msg = self.new_message(Event::Seen, channel_id, user_id, message_id.to_string())?;
        msg.seen = true;
        self.publish_message(&msg).await.context(context())?;
        Ok(msg)
    }

    pub async fn insert_message(&self, msg: &Message) -> Result<()> {
        self.messages
            .insert_message(msg)
            .await
            .context("insert message")
    }

    /// Publish on the shared message topic
    pub async fn publish_message(&self, msg: &Message) -> Result<()> {
        let payload = msg.encode()?;
        self.broker
            .publish(MESSAGE_TOPIC, Bytes::from(payload))
            .await
            .context("publish message")
    }

    /// Recent history of a channel, oldest first
    pub async fn list_messages(&self, channel_id: u64) -> Result<Vec<Message>> {
        self.messages
            .list_messages(channel_id)
            .await
            .context(format!("list messages in channel {}", channel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::auth::DEFAULT_TOKEN_TTL;
    use crate::chat::repo::StoreRepository;
    use crate::fanout::{MemoryBroker, Subscription};
    use crate::store::{CacheStore, MemoryStore};

    struct Fixture {
        users: UserService,
        channels: ChannelService,
        messages: MessageService,
        broker: Arc<MemoryBroker>,
        signer: Arc<TokenSigner>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let repo = Arc::new(StoreRepository::new(Arc::clone(&store)));
        let registry = ChannelRegistry::new(
            Arc::clone(&store),
            Arc::clone(&repo) as Arc<dyn UserBackend>,
            Arc::clone(&repo) as Arc<dyn ChannelBackend>,
        );
        let ids = Arc::new(IdGenerator::new(1));
        let broker = Arc::new(MemoryBroker::new());
        let signer = Arc::new(TokenSigner::new("secret", DEFAULT_TOKEN_TTL));

        Fixture {
            users: UserService::new(repo.clone(), registry.clone(), Arc::clone(&ids)),
            channels: ChannelService::new(
                repo.clone(),
                registry.clone(),
                Arc::clone(&ids),
                Arc::clone(&signer),
            ),
            messages: MessageService::new(repo, registry, broker.clone(), ids),
            broker,
            signer,
        }
    }

    async fn next_message(sub: &mut Subscription) -> Message {
        let payload = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        Message::decode(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_create_user() {
        let f = fixture();

        let user = f.users.create_user(" alice ").await.unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(f.users.get_user(user.id).await.unwrap(), user);

        assert!(matches!(
            f.users.create_user("  ").await,
            Err(Error::Validation(_))
        ));
        assert!(f.users.get_user(user.id + 1).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_channel_token_verifies() {
        let f = fixture();

        let channel = f.channels.create_channel().await.unwrap();
        let claims = f.signer.verify(&channel.access_token).unwrap();
        assert_eq!(claims.channel_id, channel.id);

        f.users.add_user_to_channel(channel.id, 1).await.unwrap();
        assert_eq!(
            f.users.is_channel_user_exist(channel.id, 1).await.unwrap(),
            Membership::Member
        );
    }

    #[tokio::test]
    async fn test_connect_message_waiting_then_joined() {
        let f = fixture();
        let channel = f.channels.create_channel().await.unwrap();
        let mut sub = f.broker.subscribe(MESSAGE_TOPIC).await.unwrap();

        f.users.add_online_user(channel.id, 1).await.unwrap();
        f.messages
            .broadcast_connect_message(channel.id, 1)
            .await
            .unwrap();
        assert_eq!(next_message(&mut sub).await.payload, "waiting");

        f.users.add_online_user(channel.id, 2).await.unwrap();
        f.messages
            .broadcast_connect_message(channel.id, 2)
            .await
            .unwrap();
        let joined = next_message(&mut sub).await;
        assert_eq!(joined.event, Event::Action);
        assert_eq!(joined.payload, "joined");
        assert_eq!(joined.user_id, 2);
    }

    #[tokio::test]
    async fn test_text_seen_and_history() {
        let f = fixture();
        let channel = f.channels.create_channel().await.unwrap();
        let mut sub = f.broker.subscribe(MESSAGE_TOPIC).await.unwrap();

        let first = f
            .messages
            .broadcast_text_message(channel.id, 1, "hello")
            .await
            .unwrap();
        f.messages
            .broadcast_file_message(channel.id, 2, "https://files/a.png")
            .await
            .unwrap();
        f.messages
            .broadcast_action_message(channel.id, 2, Action::IsTyping)
            .await
            .unwrap();

        assert_eq!(next_message(&mut sub).await, first);
        assert_eq!(next_message(&mut sub).await.event, Event::File);
        assert_eq!(next_message(&mut sub).await.event, Event::Action);

        f.messages
            .mark_message_seen(channel.id, 2, first.message_id)
            .await
            .unwrap();
        let seen = next_message(&mut sub).await;
        assert_eq!(seen.event, Event::Seen);
        assert!(seen.seen);
        assert_eq!(seen.payload, first.message_id.to_string());

        // Actions are not part of the history
        let history = f.messages.list_messages(channel.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].seen);
        assert!(!history[1].seen);
    }

    #[tokio::test]
    async fn test_list_messages_unknown_channel() {
        let f = fixture();

        let err = f.messages.list_messages(42).await.unwrap_err();
        assert!(matches!(err.root(), Error::ChannelNotFound(42)));
    }

    #[tokio::test]
    async fn test_delete_channel() {
        let f = fixture();
        let channel = f.channels.create_channel().await.unwrap();
        f.users.add_user_to_channel(channel.id, 1).await.unwrap();
        f.users.add_online_user(channel.id, 1).await.unwrap();

        f.channels.delete_channel(channel.id).await.unwrap();

        assert!(f
            .users
            .get_online_user_ids(channel.id)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            f.users.is_channel_user_exist(channel.id, 1).await.unwrap(),
            Membership::ChannelNotFound
        );
    }
}
