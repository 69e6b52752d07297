//! Session records and append-only events over a [`StateStore`].
//!
//! Every state write goes through [`SessionStore::update_row`]: read the row,
//! compute the next state, write it back conditioned on the version that was
//! read. A lost race reloads and recomputes, at most `max_attempts` times,
//! then surfaces [`StoreError::Conflict`]. A delta is never dropped silently.
//!
//! Events are inserted before state is touched and marked applied afterwards.
//! Re-appending an applied event id is a no-op; re-appending one whose earlier
//! append died between those two steps finishes applying the stored delta,
//! except for keys a later event of the same session has since written.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stagehand_common::state::{APP_PREFIX, USER_PREFIX, prefixed};
use stagehand_common::{
    EventRecord, NewEvent, ScopedDelta, SessionKey, SessionRecord, StateDelta, StateMap,
};
use tracing::{debug, info, instrument, warn};

use crate::errors::StoreError;
use crate::store::{EventInsert, RowKey, StateRow, StateStore, StoreResult};

/// Optimistic-concurrency retry policy.
#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    pub max_attempts: u32,
    /// Sleep before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(10),
        }
    }
}

/// The next content of a row, computed from its current content.
struct RowWrite {
    state: StateMap,
    is_deleted: bool,
}

impl RowWrite {
    fn live(state: StateMap) -> Self {
        Self {
            state,
            is_deleted: false,
        }
    }
}

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn StateStore>,
    config: SessionStoreConfig,
}

impl SessionStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_config(store, SessionStoreConfig::default())
    }

    pub fn with_config(store: Arc<dyn StateStore>, config: SessionStoreConfig) -> Self {
        Self { store, config }
    }

    pub fn backing_store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    /// Create a session, seeding its state from `initial_state`.
    ///
    /// Keys are routed by scope like an event delta; `temp:` keys are dropped.
    /// A soft-deleted identity is revived with fresh state.
    #[instrument(skip_all, fields(session = %key))]
    pub async fn create(&self, key: &SessionKey, initial_state: StateMap) -> StoreResult<SessionRecord> {
        let scoped = StateDelta::from(initial_state).partition();
        if !scoped.invocation.is_empty() {
            debug!(keys = scoped.invocation.len(), "dropping invocation keys from initial state");
        }

        let mut session_state = StateMap::new();
        scoped.session.apply_to(&mut session_state);

        let row_key = RowKey::Session(key.clone());
        self.update_row(&row_key, |current| match current {
            Some(row) if !row.is_deleted => Err(StoreError::AlreadyExists {
                entity: "session",
                id: key.to_string(),
            }),
            Some(_) => {
                info!("reviving soft-deleted session");
                Ok(RowWrite::live(session_state.clone()))
            }
            None => Ok(RowWrite::live(session_state.clone())),
        })
        .await?;

        self.apply_shared(key, &scoped.user, &scoped.app).await?;
        info!("session created");
        self.get(key).await
    }

    /// Materialized session: session keys plus the user's and app's shared keys.
    pub async fn get(&self, key: &SessionKey) -> StoreResult<SessionRecord> {
        let row = self
            .store
            .load_row(&RowKey::Session(key.clone()))
            .await?
            .filter(|row| !row.is_deleted)
            .ok_or_else(|| StoreError::not_found("session", key))?;
        let shared = self.load_shared(key).await?;
        Ok(materialize(key.clone(), row, &shared))
    }

    /// Live sessions of `(app, user)`, most recently updated first.
    pub async fn list(&self, app: &str, user: &str) -> StoreResult<Vec<SessionRecord>> {
        let rows = self.store.list_session_rows(app, user).await?;
        let shared_key = SessionKey::new(app, user, "");
        let shared = self.load_shared(&shared_key).await?;

        let mut sessions: Vec<SessionRecord> = rows
            .into_iter()
            .filter(|row| !row.is_deleted)
            .filter_map(|row| match &row.key {
                RowKey::Session(key) => Some(materialize(key.clone(), row.clone(), &shared)),
                _ => None,
            })
            .collect();
        sessions.sort_by(|a, b| b.last_update_time.cmp(&a.last_update_time));
        Ok(sessions)
    }

    /// Record `event` and fold its durable delta into the session.
    #[instrument(skip_all, fields(session = %key, event_id = %event.event_id))]
    pub async fn append_event(&self, key: &SessionKey, event: NewEvent) -> StoreResult<SessionRecord> {
        if event.session != *key {
            return Err(StoreError::SessionMismatch {
                target: key.to_string(),
                event_session: event.session.to_string(),
            });
        }
        self.get(key).await?;

        let mut persisted = event;
        if persisted.state_delta.has_invocation_keys() {
            debug!("stripping invocation keys before persisting event");
            persisted.state_delta = persisted.state_delta.without_invocation();
        }

        let scoped = match self.store.insert_event(&persisted).await? {
            EventInsert::Inserted(record) => {
                debug!(sequence = record.sequence, "event recorded");
                let scoped = record.state_delta.partition();
                let row_key = RowKey::Session(key.clone());
                self.update_row(&row_key, |current| session_write(key, current, &scoped.session))
                    .await?;
                scoped
            }
            EventInsert::Existing(stored) if stored.applied => {
                warn!("duplicate event ignored");
                return self.get(key).await;
            }
            EventInsert::Existing(stored) => {
                warn!(
                    sequence = stored.record.sequence,
                    "resuming application of a previously recorded event"
                );
                self.resume_event(key, &stored.record).await?
            }
        };
        self.apply_shared(key, &scoped.user, &scoped.app).await?;

        self.store
            .mark_event_applied(key, &persisted.event_id)
            .await?;
        self.get(key).await
    }

    /// Finish applying a recorded event without undoing later ones.
    ///
    /// Keys written by any later event of the session are left alone, so the
    /// result matches applying the events in sequence order. The row is read
    /// before the events are listed: a later event that already reached the
    /// row is in the list, and one that reaches it afterwards fails the CAS.
    async fn resume_event(&self, key: &SessionKey, event: &EventRecord) -> StoreResult<ScopedDelta> {
        let row_key = RowKey::Session(key.clone());
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            let current = self.store.load_row(&row_key).await?;
            let events = self.store.list_events(key).await?;
            let scoped = unshadowed(event, &events).partition();
            let write = session_write(key, current.as_ref(), &scoped.session)?;
            if self.write_row(&row_key, current.as_ref(), write).await? {
                debug!(sequence = event.sequence, attempt, "recorded event applied");
                return Ok(scoped);
            }
            self.pause_after_conflict(&row_key, attempt, attempts).await;
        }
        Err(conflict(&row_key, attempts))
    }

    /// Soft delete. Events are retained.
    #[instrument(skip_all, fields(session = %key))]
    pub async fn delete(&self, key: &SessionKey) -> StoreResult<()> {
        let row_key = RowKey::Session(key.clone());
        self.update_row(&row_key, |current| match current {
            Some(row) if !row.is_deleted => Ok(RowWrite {
                state: row.state.clone(),
                is_deleted: true,
            }),
            _ => Err(StoreError::not_found("session", key)),
        })
        .await?;
        info!("session deleted");
        Ok(())
    }

    /// Events of a session in sequence order, including those of a deleted session.
    pub async fn events(&self, key: &SessionKey) -> StoreResult<Vec<EventRecord>> {
        self.store.list_events(key).await
    }

    async fn apply_shared(
        &self,
        key: &SessionKey,
        user: &StateDelta,
        app: &StateDelta,
    ) -> StoreResult<()> {
        for (row_key, delta) in [(RowKey::user_of(key), user), (RowKey::app_of(key), app)] {
            if delta.is_empty() {
                continue;
            }
            self.update_row(&row_key, |current| {
                let mut state = current.map(|row| row.state.clone()).unwrap_or_default();
                delta.apply_to(&mut state);
                Ok(RowWrite::live(state))
            })
            .await?;
        }
        Ok(())
    }

    async fn load_shared(&self, key: &SessionKey) -> StoreResult<StateMap> {
        let mut shared = StateMap::new();
        if let Some(row) = self.store.load_row(&RowKey::user_of(key)).await? {
            shared.extend(prefixed(&row.state, USER_PREFIX));
        }
        if let Some(row) = self.store.load_row(&RowKey::app_of(key)).await? {
            shared.extend(prefixed(&row.state, APP_PREFIX));
        }
        Ok(shared)
    }

    /// Read-modify-write one row under its version.
    ///
    /// `mutate` sees the current row (or `None`) and returns its next content,
    /// or an error that aborts without retrying.
    async fn update_row<F>(&self, key: &RowKey, mut mutate: F) -> StoreResult<StateRow>
    where
        F: FnMut(Option<&StateRow>) -> StoreResult<RowWrite>,
    {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            let current = self.store.load_row(key).await?;
            let write = mutate(current.as_ref())?;
            let next = next_row(key, current.as_ref(), write);
            if self.store_row(&next, current.as_ref()).await? {
                debug!(row = %key, version = next.version, attempt, "row written");
                return Ok(next);
            }
            self.pause_after_conflict(key, attempt, attempts).await;
        }
        Err(conflict(key, attempts))
    }

    /// One conditional write of `write` over `current`. False on a lost race.
    async fn write_row(&self, key: &RowKey, current: Option<&StateRow>, write: RowWrite) -> StoreResult<bool> {
        let next = next_row(key, current, write);
        self.store_row(&next, current).await
    }

    async fn store_row(&self, next: &StateRow, current: Option<&StateRow>) -> StoreResult<bool> {
        match current {
            Some(row) => self.store.replace_row(next, row.version).await,
            None => self.store.insert_row(next).await,
        }
    }

    async fn pause_after_conflict(&self, key: &RowKey, attempt: u32, attempts: u32) {
        warn!(row = %key, attempt, "version conflict, retrying");
        if attempt < attempts {
            tokio::time::sleep(self.config.backoff * attempt).await;
        }
    }
}

fn next_row(key: &RowKey, current: Option<&StateRow>, write: RowWrite) -> StateRow {
    StateRow {
        key: key.clone(),
        state: write.state,
        version: current.map_or(1, |row| row.version + 1),
        updated_at: Utc::now(),
        is_deleted: write.is_deleted,
    }
}

fn conflict(key: &RowKey, attempts: u32) -> StoreError {
    StoreError::Conflict {
        id: format!("{} {}", key.entity(), key),
        attempts,
    }
}

/// The session row with `delta` applied; a missing or deleted session is not found.
fn session_write(key: &SessionKey, current: Option<&StateRow>, delta: &StateDelta) -> StoreResult<RowWrite> {
    match current {
        Some(row) if !row.is_deleted => {
            let mut state = row.state.clone();
            delta.apply_to(&mut state);
            Ok(RowWrite::live(state))
        }
        _ => Err(StoreError::not_found("session", key)),
    }
}

/// `event`'s delta minus keys that a later event in `events` also writes.
fn unshadowed(event: &EventRecord, events: &[EventRecord]) -> StateDelta {
    let later: Vec<&EventRecord> = events.iter().filter(|e| e.sequence > event.sequence).collect();
    let mut kept = StateDelta::new();
    for (name, op) in event.state_delta.iter() {
        if later.iter().any(|e| e.state_delta.get(name).is_some()) {
            debug!(key = %name, "key superseded by a later event");
            continue;
        }
        kept.insert(name.clone(), op.clone());
    }
    kept
}

fn materialize(key: SessionKey, row: StateRow, shared: &StateMap) -> SessionRecord {
    let mut state = row.state;
    state.extend(shared.iter().map(|(k, v)| (k.clone(), v.clone())));
    SessionRecord {
        key,
        state,
        version: row.version,
        last_update_time: row.updated_at,
        is_deleted: row.is_deleted,
    }
}
