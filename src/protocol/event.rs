//! Events fanned out to connected clients

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known event kinds
pub mod kinds {
    /// Sent to a connection once it is registered and authenticated
    pub const HELLO: &str = "hello";
    /// A user is typing in a team
    pub const TYPING: &str = "typing";
    /// Inbox notification ping
    pub const INBOX_PING: &str = "inbox_ping";
    /// Presence change
    pub const STATUS_CHANGE: &str = "status_change";
}

/// Who an event is delivered to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Broadcast {
    /// Every connection of a single user
    User(String),
    /// Every authenticated connection except these users
    Omit(HashSet<String>),
    /// Connections whose session lists this team
    Team(String),
    /// Every authenticated connection
    All,
}

/// An event published to the fan-out layer.
///
/// Events are shared between every connection they are delivered to,
/// so once built they are only ever read. Per-connection fields such as
/// the sequence number live in [`EventEnvelope`](super::EventEnvelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    kind: String,
    #[serde(default)]
    data: Map<String, Value>,
    broadcast: Broadcast,
}

impl Event {
    /// Create an event with an empty payload
    pub fn new(kind: impl Into<String>, broadcast: Broadcast) -> Self {
        Self {
            kind: kind.into(),
            data: Map::new(),
            broadcast,
        }
    }

    /// Add a payload field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Replace the whole payload
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn broadcast(&self) -> &Broadcast {
        &self.broadcast
    }

    /// The single user this event targets, if any
    pub fn target_user(&self) -> Option<&str> {
        match &self.broadcast {
            Broadcast::User(user_id) => Some(user_id),
            _ => None,
        }
    }
}
