//! Chat domain types and their wire encodings
//!
//! [`Message`] is the envelope carried on the bus. Clients see
//! [`MessagePresenter`], which renders ids as decimal strings so they
//! survive JavaScript number parsing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Message event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Event {
    Text = 0,
    Action = 1,
    Seen = 2,
    File = 3,
}

impl From<Event> for u8 {
    fn from(event: Event) -> u8 {
        event as u8
    }
}

impl TryFrom<u8> for Event {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Event::Text),
            1 => Ok(Event::Action),
            2 => Ok(Event::Seen),
            3 => Ok(Event::File),
            other => Err(format!("invalid event type: {}", other)),
        }
    }
}

/// Presence and typing signals carried in action message payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Sender is alone in the channel
    Waiting,
    /// Sender joined a channel someone else is already in
    Joined,
    IsTyping,
    EndTyping,
    /// Sender disconnected
    Offline,
    /// Sender deleted the channel
    Leaved,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Waiting => "waiting",
            Action::Joined => "joined",
            Action::IsTyping => "istyping",
            Action::EndTyping => "endtyping",
            Action::Offline => "offline",
            Action::Leaved => "leaved",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(Action::Waiting),
            "joined" => Ok(Action::Joined),
            "istyping" => Ok(Action::IsTyping),
            "endtyping" => Ok(Action::EndTyping),
            "offline" => Ok(Action::Offline),
            "leaved" => Ok(Action::Leaved),
            other => Err(Error::Validation(format!("unknown action: {}", other))),
        }
    }
}

/// Chat message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: u64,
    pub event: Event,
    pub channel_id: u64,
    pub user_id: u64,
    pub payload: String,
    #[serde(default)]
    pub seen: bool,
    /// Unix milliseconds
    pub time: i64,
}

impl Message {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_presenter(&self) -> MessagePresenter {
        MessagePresenter {
            message_id: self.message_id.to_string(),
            event: self.event,
            user_id: self.user_id.to_string(),
            payload: self.payload.clone(),
            seen: self.seen,
            time: self.time,
        }
    }
}

/// Client-facing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePresenter {
    #[serde(default)]
    pub message_id: String,
    pub event: Event,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub seen: bool,
    #[serde(default)]
    pub time: i64,
}

impl MessagePresenter {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Chat channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: u64,
    pub access_token: String,
}

/// Registered user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
}

/// Client-facing user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresenter {
    pub id: String,
    pub name: String,
}

impl From<&User> for UserPresenter {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.to_string(),
            name: user.name.clone(),
        }
    }
}

/// Parse a decimal id as sent by clients
pub fn parse_id(s: &str) -> Result<u64> {
    s.trim()
        .parse()
        .map_err(|_| Error::Validation(format!("invalid id: {:?}", s)))
}
