//! Shared waitlist of users looking for a partner
//!
//! The waitlist is a sorted set scored by enqueue time. Pairing is a single
//! atomic pop-or-enqueue against the store, so concurrent callers on any
//! number of nodes can never pop the same waiter twice.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chat::domain::parse_id;
use crate::error::Result;
use crate::store::keys::USER_WAIT_LIST;
use crate::store::CacheStore;

/// Outcome of [`WaitList::pop_or_push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pairing {
    /// Paired with a waiting peer; the caller was not enqueued
    Matched(u64),
    /// Enqueued, or already waiting
    Waiting,
}

/// Waitlist stored under `rc:userwait`
#[derive(Clone)]
pub struct WaitList {
    store: Arc<dyn CacheStore>,
}

impl WaitList {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Pair `user_id` with the earliest waiter, or enqueue it
    ///
    /// Calling again for a user that is already waiting changes nothing.
    pub async fn pop_or_push(&self, user_id: u64) -> Result<Pairing> {
        let popped = self
            .store
            .zpop_min_or_add(USER_WAIT_LIST, now_secs(), &user_id.to_string())
            .await?;

        match popped {
            Some(peer) => Ok(Pairing::Matched(parse_id(&peer)?)),
            None => Ok(Pairing::Waiting),
        }
    }

    /// Withdraw a waiting user (no-op if not waiting)
    pub async fn remove(&self, user_id: u64) -> Result<()> {
        self.store.zrem(USER_WAIT_LIST, &user_id.to_string()).await
    }

    /// Whether `user_id` is currently waiting
    pub async fn contains(&self, user_id: u64) -> Result<bool> {
        Ok(self
            .store
            .zscore(USER_WAIT_LIST, &user_id.to_string())
            .await?
            .is_some())
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as f64)
        .unwrap_or(0.0)
}
