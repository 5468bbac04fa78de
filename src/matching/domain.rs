//! Match result types

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome of one matching attempt
///
/// Carried as JSON on the match topic. An unmatched result has zero ids and
/// an empty token and is never published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    pub user_id: u64,
    pub peer_id: u64,
    pub channel_id: u64,
    pub access_token: String,
}

impl MatchResult {
    /// Result of an attempt that left the user waiting
    pub fn unmatched() -> Self {
        Self::default()
    }

    /// The two users paired by this result
    pub fn users(&self) -> [u64; 2] {
        [self.user_id, self.peer_id]
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_presenter(&self) -> MatchResultPresenter {
        MatchResultPresenter {
            access_token: self.access_token.clone(),
        }
    }
}

/// What a matched client receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResultPresenter {
    pub access_token: String,
}

impl MatchResultPresenter {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presenter_only_exposes_token() {
        let result = MatchResult {
            matched: true,
            user_id: 1,
            peer_id: 2,
            channel_id: 3,
            access_token: "tok".into(),
        };

        assert_eq!(
            result.to_presenter().encode().unwrap(),
            r#"{"access_token":"tok"}"#
        );
        assert_eq!(result.users(), [1, 2]);
        assert_eq!(
            MatchResult::decode(result.encode().unwrap().as_bytes()).unwrap(),
            result
        );
    }

    #[test]
    fn test_unmatched_is_empty() {
        let r = MatchResult::unmatched();
        assert!(!r.matched);
        assert!(r.access_token.is_empty());
    }
}
