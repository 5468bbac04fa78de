//! Error types
//!
//! A single crate-wide [`Error`] covers every layer. Storage and broker
//! failures are transient and may be retried; the rest are terminal for the
//! operation that produced them.

use std::io;

use crate::auth::AuthError;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Crate error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shared store round-trip failed
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Store returned something the adapter could not interpret
    #[error("unexpected store reply: {0}")]
    StoreReply(String),

    /// Pub/sub broker failure
    #[error("broker error: {0}")]
    Broker(String),

    /// JSON encode/decode failure
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Invalid request parameters
    #[error("validation error: {0}")]
    Validation(String),

    /// Settings could not be loaded
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    /// User does not exist
    #[error("user not found: {0}")]
    UserNotFound(u64),

    /// Channel does not exist
    #[error("channel not found: {0}")]
    ChannelNotFound(u64),

    /// Channel exists but the user is not a member of it
    #[error("user {user_id} is not a member of channel {channel_id}")]
    NotChannelMember { channel_id: u64, user_id: u64 },

    /// Access token rejected
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Distributed lock could not be acquired before the deadline
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// Caller is rate limited
    #[error("rate limited")]
    RateLimited,

    /// Id generator cannot produce more ids
    #[error("id generator error: {0}")]
    IdGenerator(String),

    /// Worker pool no longer accepts or runs tasks
    #[error("worker pool stopped")]
    PoolStopped,

    /// WebSocket transport failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error with operation context attached
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with a description of the failed operation
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers removed
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether retrying the failed operation could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            Error::Store(_)
                | Error::StoreReply(_)
                | Error::Broker(_)
                | Error::LockTimeout(_)
                | Error::Io(_)
        )
    }

    /// Whether the error means the requested entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Error::UserNotFound(_) | Error::ChannelNotFound(_) | Error::NotChannelMember { .. }
        )
    }
}

/// Attach operation context to a failed result
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
