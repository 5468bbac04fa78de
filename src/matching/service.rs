//! Matching service
//!
//! Pairs users through the [`WaitList`], opens a channel for every pair and
//! publishes the result so whichever nodes hold the two match sessions can
//! deliver the access token.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::domain::MatchResult;
use super::waitlist::{Pairing, WaitList};
use crate::chat::domain::{Channel, User};
use crate::error::{Result, ResultExt};
use crate::fanout::topic::MATCH_TOPIC;
use crate::fanout::Broker;

/// Opens a new chat channel with a fresh access token
#[async_trait]
pub trait ChannelCreator: Send + Sync {
    async fn create_channel(&self) -> Result<Channel>;
}

/// Records channel membership
#[async_trait]
pub trait MembershipWriter: Send + Sync {
    async fn add_user_to_channel(&self, channel_id: u64, user_id: u64) -> Result<()>;
}

/// Looks up registered users
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Returns [`Error::UserNotFound`](crate::Error::UserNotFound) for an
    /// unknown id
    async fn get_user(&self, user_id: u64) -> Result<User>;
}

/// Matching service
pub struct MatchingService {
    waitlist: WaitList,
    broker: Arc<dyn Broker>,
    channels: Arc<dyn ChannelCreator>,
    users: Arc<dyn UserDirectory>,
}

impl MatchingService {
    pub fn new(
        waitlist: WaitList,
        broker: Arc<dyn Broker>,
        channels: Arc<dyn ChannelCreator>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            waitlist,
            broker,
            channels,
            users,
        }
    }

    /// Look up a user before letting it join the waitlist
    pub async fn get_user(&self, user_id: u64) -> Result<User> {
        self.users
            .get_user(user_id)
            .await
            .context(format!("get user {}", user_id))
    }

    /// Try to pair `user_id`
    ///
    /// On a match a channel is created and its token returned in the result.
    /// Otherwise the user is left waiting and an unmatched result returned.
    pub async fn match_user(&self, user_id: u64) -> Result<MatchResult> {
        let pairing = self
            .waitlist
            .pop_or_push(user_id)
            .await
            .context(format!("match user {}", user_id))?;

        let peer_id = match pairing {
            Pairing::Matched(peer_id) => peer_id,
            Pairing::Waiting => {
                tracing::debug!(user_id = user_id, "User waiting for a match");
                return Ok(MatchResult::unmatched());
            }
        };

        let channel = self
            .channels
            .create_channel()
            .await
            .context("create channel")?;

        tracing::info!(
            user_id = user_id,
            peer_id = peer_id,
            channel_id = channel.id,
            "Users matched"
        );

        Ok(MatchResult {
            matched: true,
            user_id,
            peer_id,
            channel_id: channel.id,
            access_token: channel.access_token,
        })
    }

    /// Publish a match result to every gateway node
    pub async fn broadcast_match_result(&self, result: &MatchResult) -> Result<()> {
        let payload = result.encode()?;
        self.broker
            .publish(MATCH_TOPIC, Bytes::from(payload))
            .await
            .context("broadcast match result")
    }

    /// Withdraw a user that gave up waiting
    pub async fn remove_user_from_waitlist(&self, user_id: u64) -> Result<()> {
        self.waitlist
            .remove(user_id)
            .await
            .context(format!("remove user {} from wait list", user_id))
    }
}
