//! Channel access tokens
//!
//! Token layout: `<channel_id>.<expires_at>.<hex(hmac_sha256(secret, "<channel_id>.<expires_at>"))>`
//! where `expires_at` is a Unix timestamp in seconds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Default token lifetime
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Token rejection reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Malformed token or bad signature
    #[error("invalid token")]
    Invalid,
    /// Signature is valid but the token has expired
    #[error("token expired")]
    Expired,
}

/// Verified token contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClaims {
    pub channel_id: u64,
    pub expires_at: u64,
}

/// Issues and verifies channel access tokens
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl,
        }
    }

    /// Token lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn mac(&self, signed: &str) -> Result<HmacSha256, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::Invalid)?;
        mac.update(signed.as_bytes());
        Ok(mac)
    }

    /// Issue a token for `channel_id` expiring after the configured lifetime
    pub fn issue(&self, channel_id: u64) -> Result<String, AuthError> {
        self.issue_at(channel_id, unix_now())
    }

    fn issue_at(&self, channel_id: u64, now: u64) -> Result<String, AuthError> {
        let expires_at = now + self.ttl.as_secs();
        let signed = format!("{}.{}", channel_id, expires_at);
        let signature = hex::encode(self.mac(&signed)?.finalize().into_bytes());
        Ok(format!("{}.{}", signed, signature))
    }

    /// Verify a token and return its claims
    pub fn verify(&self, token: &str) -> Result<ChannelClaims, AuthError> {
        self.verify_at(token, unix_now())
    }

    fn verify_at(&self, token: &str, now: u64) -> Result<ChannelClaims, AuthError> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();

        let (signed, signature) = token.rsplit_once('.').ok_or(AuthError::Invalid)?;
        let (channel_id, expires_at) = signed.split_once('.').ok_or(AuthError::Invalid)?;
        let channel_id: u64 = channel_id.parse().map_err(|_| AuthError::Invalid)?;
        let expires_at: u64 = expires_at.parse().map_err(|_| AuthError::Invalid)?;
        let signature = hex::decode(signature).map_err(|_| AuthError::Invalid)?;

        self.mac(signed)?
            .verify_slice(&signature)
            .map_err(|_| AuthError::Invalid)?;

        if now >= expires_at {
            return Err(AuthError::Expired);
        }

        Ok(ChannelClaims {
            channel_id,
            expires_at,
        })
    }
}
