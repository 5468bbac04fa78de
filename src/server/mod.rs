//! Gateway server
//!
//! A gateway node accepts WebSocket connections on two routes:
//!
//! - `/match?uid=<id>`: waits for a partner and receives
//!   `{"access_token": "..."}` once matched
//! - `/chat?uid=<id>&access_token=<token>`: joins the token's channel and
//!   exchanges chat messages
//!
//! [`Gateway`] holds the per-connection operations; [`GatewayServer`] adds
//! the TCP listener and the fanout subscribers.

pub mod config;
pub mod connection;
pub mod gateway;
pub mod listener;

pub use self::config::{GatewayConfig, RateLimit, StoreBackend};
pub use connection::Route;
pub use gateway::{Attached, Gateway};
pub use listener::GatewayServer;
