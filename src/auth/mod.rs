//! Channel authorization

pub mod token;

pub use token::{AuthError, ChannelClaims, TokenSigner, DEFAULT_TOKEN_TTL};
