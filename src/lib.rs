//! Random one-on-one chat over WebSocket
//!
//! Users connect to any gateway node to be matched with a stranger; the
//! matched pair gets a channel and an access token, then reconnects to chat.
//! Nodes share state only through a key/value store and a pub/sub broker
//! (Redis in production, in-memory for tests), so any number of them can
//! run side by side.
//!
//! # Example
//!
//! ```no_run
//! use randchat_rs::{GatewayConfig, GatewayServer};
//!
//! #[tokio::main]
//! async fn main() -> randchat_rs::Result<()> {
//!     let config = GatewayConfig::from_env()?;
//!     let server = GatewayServer::connect(config).await?;
//!     server.run().await
//! }
//! ```
//!
//! # Modules
//!
//! - [`matching`]: waitlist pairing and match result publishing
//! - [`chat`]: users, channels, membership cache and messages
//! - [`fanout`]: broker adapters and the subscribers that deliver events to
//!   local sessions
//! - [`session`]: the per-node session table
//! - [`store`]: the shared store, distributed mutex and rate limiter
//! - [`pool`]: worker pool and retry policy used by the subscribers
//! - [`server`]: the WebSocket gateway

pub mod auth;
pub mod chat;
pub mod error;
pub mod fanout;
pub mod idgen;
pub mod matching;
pub mod pool;
pub mod server;
pub mod session;
pub mod stats;
pub mod store;

pub use error::{Error, Result};
pub use server::{Gateway, GatewayConfig, GatewayServer, StoreBackend};
