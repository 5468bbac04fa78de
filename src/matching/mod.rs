//! Random pairing of waiting users
//!
//! A match session calls [`MatchingService::match_user`]. The first caller
//! waits; the next caller pops it, a channel is created, and the result is
//! published on the match topic for delivery to both sessions.

pub mod domain;
pub mod service;
pub mod waitlist;

pub use domain::{MatchResult, MatchResultPresenter};
pub use service::{ChannelCreator, MatchingService, MembershipWriter, UserDirectory};
pub use waitlist::{Pairing, WaitList};
