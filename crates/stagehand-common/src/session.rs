//! Session identities, session records and event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::{StateDelta, StateMap};

/// Globally unique identity of a session: `(app, user, session)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub app: String,
    pub user: String,
    pub session: String,
}

impl SessionKey {
    pub fn new(app: impl Into<String>, user: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            user: user.into(),
            session: session.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.app, self.user, self.session)
    }
}

/// Materialized view of a session.
///
/// `state` holds session-scoped keys plus the owning user's `user:*` keys and
/// the app's `app:*` keys. It never contains `temp:` keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub key: SessionKey,
    pub state: StateMap,
    pub version: u64,
    pub last_update_time: DateTime<Utc>,
    pub is_deleted: bool,
}

impl SessionRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.state.get(key).and_then(Value::as_str)
    }
}

/// An event as submitted by a writer, before the store assigns a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub session: SessionKey,
    pub event_id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub state_delta: StateDelta,
    pub payload: Value,
}

impl NewEvent {
    /// New event with a random id, stamped now, with no delta or payload.
    pub fn new(session: SessionKey, author: impl Into<String>) -> Self {
        Self {
            session,
            event_id: Uuid::new_v4().to_string(),
            author: author.into(),
            timestamp: Utc::now(),
            state_delta: StateDelta::new(),
            payload: Value::Null,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_delta(mut self, delta: StateDelta) -> Self {
        self.state_delta = delta;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A persisted, immutable event. Ordered by `sequence` within its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub session: SessionKey,
    pub event_id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub state_delta: StateDelta,
    pub payload: Value,
}
