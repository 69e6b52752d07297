//! Table-store abstraction backing sessions, events and artifacts.
//!
//! The contract mirrors an append/upsert-only, eventually-consistent table
//! store: rows are inserted if absent, replaced only under a version (or
//! status) precondition, and never physically deleted. Scope partitioning,
//! retries and lifecycle rules live above this layer in [`crate::session`]
//! and [`crate::artifacts`].
//!
//! Two implementations ship: [`MemoryStore`] for tests and ephemeral runs, and
//! [`SqliteStore`] for durable local state.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stagehand_common::{ArtifactRecord, ArtifactStatus, EventRecord, NewEvent, SessionKey, StateMap};

use crate::errors::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Identity of a versioned state row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    App(String),
    User { app: String, user: String },
    Session(SessionKey),
}

impl RowKey {
    pub fn user_of(key: &SessionKey) -> Self {
        Self::User {
            app: key.app.clone(),
            user: key.user.clone(),
        }
    }

    pub fn app_of(key: &SessionKey) -> Self {
        Self::App(key.app.clone())
    }

    pub fn entity(&self) -> &'static str {
        match self {
            Self::App(_) => "app state",
            Self::User { .. } => "user state",
            Self::Session(_) => "session",
        }
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::App(app) => write!(f, "{app}"),
            Self::User { app, user } => write!(f, "{app}/{user}"),
            Self::Session(key) => write!(f, "{key}"),
        }
    }
}

/// One versioned state row (session, user or app scope).
#[derive(Debug, Clone, PartialEq)]
pub struct StateRow {
    pub key: RowKey,
    pub state: StateMap,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl StateRow {
    /// Fresh row at version 1.
    pub fn new(key: RowKey, state: StateMap) -> Self {
        Self {
            key,
            state,
            version: 1,
            updated_at: Utc::now(),
            is_deleted: false,
        }
    }
}

/// An event row plus whether its delta has reached the state rows.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub record: EventRecord,
    pub applied: bool,
}

/// Result of an idempotent event insert.
#[derive(Debug, Clone, PartialEq)]
pub enum EventInsert {
    /// The event was new; the store assigned its sequence.
    Inserted(EventRecord),
    /// An event with the same id already existed and was left untouched.
    Existing(StoredEvent),
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_row(&self, key: &RowKey) -> StoreResult<Option<StateRow>>;

    /// Insert a row if its key is absent. Returns `false` if it already existed.
    async fn insert_row(&self, row: &StateRow) -> StoreResult<bool>;

    /// Replace a row only if its stored version still equals `expected_version`.
    /// Returns `false` when the precondition failed.
    async fn replace_row(&self, row: &StateRow, expected_version: u64) -> StoreResult<bool>;

    /// Every session row of `(app, user)`, deleted ones included.
    async fn list_session_rows(&self, app: &str, user: &str) -> StoreResult<Vec<StateRow>>;

    /// Insert keyed by `(app, user, session, event_id)`; a true no-op if the key exists.
    async fn insert_event(&self, event: &NewEvent) -> StoreResult<EventInsert>;

    async fn mark_event_applied(&self, session: &SessionKey, event_id: &str) -> StoreResult<()>;

    /// Events of a session ordered by sequence.
    async fn list_events(&self, session: &SessionKey) -> StoreResult<Vec<EventRecord>>;

    /// Insert an artifact if its id is absent. Returns `false` if it already existed.
    async fn insert_artifact(&self, artifact: &ArtifactRecord) -> StoreResult<bool>;

    async fn load_artifact(&self, artifact_id: &str) -> StoreResult<Option<ArtifactRecord>>;

    /// Replace an artifact only if its stored status still equals `expected_status`.
    async fn replace_artifact(
        &self,
        artifact: &ArtifactRecord,
        expected_status: ArtifactStatus,
    ) -> StoreResult<bool>;

    async fn list_artifacts(&self, session_id: &str) -> StoreResult<Vec<ArtifactRecord>>;
}
