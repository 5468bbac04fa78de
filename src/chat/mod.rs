//! Chat channels, membership, presence and messages
//!
//! - [`domain`]: message envelope, events, actions and client presenters
//! - [`repo`]: authoritative user/channel/message records
//! - [`cache`]: cache-aside membership and online presence
//! - [`service`]: the operations the gateway calls

pub mod cache;
pub mod domain;
pub mod repo;
pub mod service;

pub use cache::{ChannelRegistry, Membership};
pub use domain::{Action, Channel, Event, Message, MessagePresenter, User, UserPresenter};
pub use repo::{ChannelBackend, MessageBackend, StoreRepository, UserBackend};
pub use service::{ChannelService, MessageService, UserService};
