//! Cross-node event fanout
//!
//! Gateway nodes are stateless and share nothing but the store and the
//! broker. Events reach the node holding the recipient's connection in one
//! of two ways:
//!
//! - broadcast and filter: every node consumes the topic and keeps only
//!   what its own sessions need ([`MatchSubscriber`], [`MessageSubscriber`])
//! - selective forwarding: the [`Forwarder`] looks up which nodes hold a
//!   channel and republishes to their per-node topics

pub mod broker;
pub mod forwarder;
pub mod subscriber;
pub mod topic;

pub use broker::{Broker, MemoryBroker, RedisBroker, Subscription};
pub use forwarder::{ForwardRepo, Forwarder};
pub use subscriber::{MatchSubscriber, MessageSubscriber, SubscriberOptions};
