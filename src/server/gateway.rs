//! Gateway operations
//!
//! Everything a gateway node does for a connection, independent of the
//! WebSocket transport: validating and attaching match and chat sessions,
//! dispatching inbound chat frames, and cleaning up on close. The
//! connection handler drives these; the subscribers started by
//! [`Gateway::start_subscribers`] feed the sessions' outbound queues.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::GatewayConfig;
use crate::auth::TokenSigner;
use crate::chat::domain::{parse_id, Action, Event, Message, MessagePresenter};
use crate::chat::{
    ChannelBackend, ChannelRegistry, ChannelService, Membership, MessageBackend, MessageService,
    StoreRepository, UserBackend, UserService,
};
use crate::error::{Error, Result};
use crate::fanout::topic::{node_subscriber, MESSAGE_TOPIC};
use crate::fanout::{
    Broker, ForwardRepo, Forwarder, MatchSubscriber, MessageSubscriber, SubscriberOptions,
};
use crate::idgen::IdGenerator;
use crate::matching::{MatchingService, WaitList};
use crate::pool::RetryPolicy;
use crate::session::{SessionAttrs, SessionHandle, SessionRegistry};
use crate::store::{CacheStore, RateLimiter};
use crate::stats::DeliverySnapshot;

/// Rate limiter bucket state expiry
const RATE_LIMIT_EXPIRATION: std::time::Duration = std::time::Duration::from_secs(60);

/// A registered session and its outbound queue
pub struct Attached {
    pub session: Arc<SessionHandle>,
    pub outbound: mpsc::UnboundedReceiver<Bytes>,
}

/// Services and session table of one gateway node
pub struct Gateway {
    config: GatewayConfig,
    broker: Arc<dyn Broker>,
    sessions: Arc<SessionRegistry>,
    matching: MatchingService,
    users: Arc<UserService>,
    channels: Arc<ChannelService>,
    messages: MessageService,
    forward: ForwardRepo,
    signer: Arc<TokenSigner>,
    limiter: Option<RateLimiter>,
    subscriber_topic: String,
    match_subscriber: MatchSubscriber,
    message_subscriber: MessageSubscriber,
}

impl Gateway {
    /// Wire the services of one node over a shared store and broker
    pub fn new(config: GatewayConfig, store: Arc<dyn CacheStore>, broker: Arc<dyn Broker>) -> Self {
        let repo = Arc::new(StoreRepository::new(Arc::clone(&store)).max_messages(config.max_messages));
        let registry = ChannelRegistry::new(
            Arc::clone(&store),
            Arc::clone(&repo) as Arc<dyn UserBackend>,
            Arc::clone(&repo) as Arc<dyn ChannelBackend>,
        );
        let ids = Arc::new(IdGenerator::new(config.machine_id));
        let signer = Arc::new(TokenSigner::new(&config.jwt_secret, config.token_ttl));
        let sessions = Arc::new(SessionRegistry::new());

        let users = Arc::new(UserService::new(
            Arc::clone(&repo) as Arc<dyn UserBackend>,
            registry.clone(),
            Arc::clone(&ids),
        ));
        let channels = Arc::new(ChannelService::new(
            Arc::clone(&repo) as Arc<dyn ChannelBackend>,
            registry.clone(),
            Arc::clone(&ids),
            Arc::clone(&signer),
        ));
        let messages = MessageService::new(
            repo as Arc<dyn MessageBackend>,
            registry,
            Arc::clone(&broker),
            ids,
        );
        let matching = MatchingService::new(
            WaitList::new(Arc::clone(&store)),
            Arc::clone(&broker),
            Arc::clone(&channels) as _,
            Arc::clone(&users) as _,
        );

        let limiter = config.rate_limit.map(|limit| {
            RateLimiter::new(
                Arc::clone(&store),
                limit.rps,
                limit.burst,
                RATE_LIMIT_EXPIRATION,
            )
        });

        let subscriber_topic = if config.selective_forwarding {
            node_subscriber(&config.node_id)
        } else {
            MESSAGE_TOPIC.to_string()
        };

        let retry = RetryPolicy::default();
        let match_subscriber = MatchSubscriber::new(
            Arc::clone(&broker),
            Arc::clone(&sessions),
            Arc::clone(&users) as _,
            SubscriberOptions::default()
                .workers(config.match_workers)
                .retry(retry),
        );
        let message_subscriber = MessageSubscriber::new(
            Arc::clone(&broker),
            Arc::clone(&sessions),
            subscriber_topic.clone(),
            SubscriberOptions::default()
                .workers(config.message_workers)
                .retry(retry),
        );

        Self {
            config,
            broker,
            sessions,
            matching,
            users,
            channels,
            messages,
            forward: ForwardRepo::new(store),
            signer,
            limiter,
            subscriber_topic,
            match_subscriber,
            message_subscriber,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Sessions connected to this node
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn users(&self) -> &UserService {
        &self.users
    }

    pub fn channels(&self) -> &ChannelService {
        &self.channels
    }

    pub fn messages(&self) -> &MessageService {
        &self.messages
    }

    /// Topic chat messages for this node arrive on
    pub fn subscriber_topic(&self) -> &str {
        &self.subscriber_topic
    }

    /// Delivery counters of the match and message subscribers
    pub fn delivery_stats(&self) -> (DeliverySnapshot, DeliverySnapshot) {
        (
            self.match_subscriber.stats().snapshot(),
            self.message_subscriber.stats().snapshot(),
        )
    }

    /// Subscribe to the match and message topics, plus the shared message
    /// topic for forwarding when this node runs the forwarder
    ///
    /// All subscriptions are active when this returns.
    pub async fn start_subscribers(&self, shutdown: &CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = vec![
            self.match_subscriber.start(shutdown.clone()).await?,
            self.message_subscriber.start(shutdown.clone()).await?,
        ];

        if self.config.selective_forwarding && self.config.run_forwarder {
            let forwarder = Arc::new(Forwarder::new(
                Arc::clone(&self.broker),
                self.forward.clone(),
            ));
            handles.push(forwarder.start(shutdown.clone()).await?);
        }

        tracing::info!(
            node_id = %self.config.node_id,
            topic = %self.subscriber_topic,
            "Gateway subscribers started"
        );
        Ok(handles)
    }

    /// Open a match session and try to pair the user
    ///
    /// The session is registered before matching so that a result produced
    /// by this very call is delivered to it.
    pub async fn connect_match(&self, user_id: u64, peer: Option<SocketAddr>) -> Result<Attached> {
        self.matching.get_user(user_id).await?;

        let attrs = with_peer(SessionAttrs::matching(user_id), peer);
        let (session, outbound) = self.sessions.register(attrs);

        if let Err(e) = self.start_matching(user_id).await {
            self.sessions.unregister(session.id());
            return Err(e);
        }

        Ok(Attached { session, outbound })
    }

    async fn start_matching(&self, user_id: u64) -> Result<()> {
        let result = self.matching.match_user(user_id).await?;
        if result.matched {
            self.matching.broadcast_match_result(&result).await?;
        }
        Ok(())
    }

    /// Close a match session; a user still waiting leaves the waitlist
    pub async fn disconnect_match(&self, session: &SessionHandle) -> Result<()> {
        self.sessions.unregister(session.id());
        self.matching
            .remove_user_from_waitlist(session.attrs().user_id)
            .await
    }

    /// Open a chat session for a channel member holding a valid token
    ///
    /// Nothing is written until the token and membership checks pass.
    pub async fn connect_chat(
        &self,
        user_id: u64,
        access_token: &str,
        peer: Option<SocketAddr>,
    ) -> Result<Attached> {
        let channel_id = self.authorize(user_id, access_token).await?;

        let attrs = with_peer(SessionAttrs::chat(channel_id, user_id), peer);
        let (session, outbound) = self.sessions.register(attrs);

        if let Err(e) = self.attach_chat(channel_id, user_id).await {
            self.sessions.unregister(session.id());
            return Err(e);
        }

        tracing::info!(
            session_id = session.id(),
            channel_id = channel_id,
            user_id = user_id,
            "Chat session attached"
        );
        Ok(Attached { session, outbound })
    }

    /// Verify the token and the user's membership; returns the channel id
    async fn authorize(&self, user_id: u64, access_token: &str) -> Result<u64> {
        self.users.get_user(user_id).await?;
        let claims = self.signer.verify(access_token)?;
        let channel_id = claims.channel_id;

        match self.users.is_channel_user_exist(channel_id, user_id).await? {
            Membership::Member => Ok(channel_id),
            Membership::NotMember => Err(Error::NotChannelMember {
                channel_id,
                user_id,
            }),
            Membership::ChannelNotFound => Err(Error::ChannelNotFound(channel_id)),
        }
    }

    async fn attach_chat(&self, channel_id: u64, user_id: u64) -> Result<()> {
        self.users.add_online_user(channel_id, user_id).await?;
        if self.config.selective_forwarding {
            self.forward
                .register_channel_session(channel_id, user_id, &self.subscriber_topic)
                .await?;
        }
        self.messages
            .broadcast_connect_message(channel_id, user_id)
            .await?;
        Ok(())
    }

    /// Dispatch one inbound chat frame
    ///
    /// The sender is always the session's own user, whatever the frame says.
    pub async fn handle_chat_frame(&self, session: &SessionHandle, data: &[u8]) -> Result<Message> {
        if data.len() > self.config.max_message_size {
            return Err(Error::Validation(format!(
                "message of {} bytes exceeds {}",
                data.len(),
                self.config.max_message_size
            )));
        }

        let attrs = session.attrs();
        let user_id = attrs.user_id;
        let channel_id = attrs
            .channel_id
            .ok_or_else(|| Error::Validation("not a chat session".into()))?;

        if let Some(limiter) = &self.limiter {
            if !limiter.allow(&format!("chat:{}", user_id)).await? {
                return Err(Error::RateLimited);
            }
        }

        let frame = MessagePresenter::decode(data)?;
        match frame.event {
            Event::Text => {
                self.messages
                    .broadcast_text_message(channel_id, user_id, &frame.payload)
                    .await
            }
            Event::Action => {
                let action: Action = frame.payload.parse()?;
                self.messages
                    .broadcast_action_message(channel_id, user_id, action)
                    .await
            }
            Event::Seen => {
                let message_id = parse_id(&frame.payload)?;
                self.messages
                    .mark_message_seen(channel_id, user_id, message_id)
                    .await
            }
            Event::File => {
                self.messages
                    .broadcast_file_message(channel_id, user_id, &frame.payload)
                    .await
            }
        }
    }

    /// Close a chat session: drop presence and forwarding, tell the peer
    pub async fn disconnect_chat(&self, session: &SessionHandle) -> Result<()> {
        self.sessions.unregister(session.id());

        let attrs = session.attrs();
        let Some(channel_id) = attrs.channel_id else {
            return Ok(());
        };
        let user_id = attrs.user_id;

        self.users.delete_online_user(channel_id, user_id).await?;
        if self.config.selective_forwarding {
            self.forward
                .remove_channel_session(channel_id, user_id)
                .await?;
        }
        self.messages
            .broadcast_action_message(channel_id, user_id, Action::Offline)
            .await?;
        Ok(())
    }

    /// Members of the token's channel
    pub async fn channel_users(&self, access_token: &str) -> Result<Vec<u64>> {
        let claims = self.signer.verify(access_token)?;
        self.users.get_channel_user_ids(claims.channel_id).await
    }

    /// Online users of the token's channel
    pub async fn online_users(&self, access_token: &str) -> Result<Vec<u64>> {
        let claims = self.signer.verify(access_token)?;
        self.users.get_online_user_ids(claims.channel_id).await
    }

    /// Recent history of the token's channel
    pub async fn list_messages(&self, access_token: &str) -> Result<Vec<MessagePresenter>> {
        let claims = self.signer.verify(access_token)?;
        let messages = self.messages.list_messages(claims.channel_id).await?;
        Ok(messages.iter().map(Message::to_presenter).collect())
    }

    /// Leave and delete the token's channel on behalf of a member
    ///
    /// The remaining member is told with a `leaved` action first.
    pub async fn delete_channel(&self, access_token: &str, deleted_by: u64) -> Result<()> {
        let channel_id = self.authorize(deleted_by, access_token).await?;

        self.messages
            .broadcast_action_message(channel_id, deleted_by, Action::Leaved)
            .await?;
        self.channels.delete_channel(channel_id).await
    }
}

fn with_peer(attrs: SessionAttrs, peer: Option<SocketAddr>) -> SessionAttrs {
    match peer {
        Some(addr) => attrs.with_peer(addr),
        None => attrs,
    }
}
