//! Session attributes
//!
//! Attributes are fixed when a connection is accepted and never replicated
//! to other nodes. Fanout subscribers filter on them.

use std::net::SocketAddr;

/// Which endpoint a session was opened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Waiting for a match result
    Match,
    /// Attached to a chat channel
    Chat,
}

/// Connection-local session attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAttrs {
    /// Endpoint kind
    pub kind: SessionKind,

    /// Authenticated user
    pub user_id: u64,

    /// Channel, for chat sessions
    pub channel_id: Option<u64>,

    /// Remote peer address, if known
    pub peer_addr: Option<SocketAddr>,
}

impl SessionAttrs {
    /// Attributes of a match session
    pub fn matching(user_id: u64) -> Self {
        Self {
            kind: SessionKind::Match,
            user_id,
            channel_id: None,
            peer_addr: None,
        }
    }

    /// Attributes of a chat session
    pub fn chat(channel_id: u64, user_id: u64) -> Self {
        Self {
            kind: SessionKind::Chat,
            user_id,
            channel_id: Some(channel_id),
            peer_addr: None,
        }
    }

    /// Record the remote address
    pub fn with_peer(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Whether this is a match session for one of `users`
    pub fn is_matching_user(&self, users: &[u64]) -> bool {
        self.kind == SessionKind::Match && users.contains(&self.user_id)
    }

    /// Whether this is a chat session attached to `channel_id`
    pub fn is_in_channel(&self, channel_id: u64) -> bool {
        self.kind == SessionKind::Chat && self.channel_id == Some(channel_id)
    }
}
