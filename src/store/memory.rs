use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use stagehand_common::{ArtifactRecord, ArtifactStatus, EventRecord, NewEvent, SessionKey};

use super::{EventInsert, RowKey, StateRow, StateStore, StoreResult, StoredEvent};
use crate::errors::StoreError;

#[derive(Default)]
struct Tables {
    rows: BTreeMap<RowKey, StateRow>,
    events: HashMap<SessionKey, Vec<StoredEvent>>,
    artifacts: HashMap<String, ArtifactRecord>,
}

/// In-process store. Every operation holds the table lock only for the
/// duration of a map lookup, so it never blocks across an await point.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_row(&self, key: &RowKey) -> StoreResult<Option<StateRow>> {
        Ok(self.tables()?.rows.get(key).cloned())
    }

    async fn insert_row(&self, row: &StateRow) -> StoreResult<bool> {
        let mut tables = self.tables()?;
        if tables.rows.contains_key(&row.key) {
            return Ok(false);
        }
        tables.rows.insert(row.key.clone(), row.clone());
        Ok(true)
    }

    async fn replace_row(&self, row: &StateRow, expected_version: u64) -> StoreResult<bool> {
        let mut tables = self.tables()?;
        match tables.rows.get_mut(&row.key) {
            Some(current) if current.version == expected_version => {
                *current = row.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_session_rows(&self, app: &str, user: &str) -> StoreResult<Vec<StateRow>> {
        Ok(self
            .tables()?
            .rows
            .values()
            .filter(|row| match &row.key {
                RowKey::Session(key) => key.app == app && key.user == user,
                _ => false,
            })
            .cloned()
            .collect())
    }

    async fn insert_event(&self, event: &NewEvent) -> StoreResult<EventInsert> {
        let mut tables = self.tables()?;
        let events = tables.events.entry(event.session.clone()).or_default();
        if let Some(existing) = events.iter().find(|e| e.record.event_id == event.event_id) {
            return Ok(EventInsert::Existing(existing.clone()));
        }
        let sequence = events.iter().map(|e| e.record.sequence).max().unwrap_or(0) + 1;
        let record = EventRecord {
            session: event.session.clone(),
            event_id: event.event_id.clone(),
            author: event.author.clone(),
            timestamp: event.timestamp,
            sequence,
            state_delta: event.state_delta.clone(),
            payload: event.payload.clone(),
        };
        events.push(StoredEvent {
            record: record.clone(),
            applied: false,
        });
        Ok(EventInsert::Inserted(record))
    }

    async fn mark_event_applied(&self, session: &SessionKey, event_id: &str) -> StoreResult<()> {
        let mut tables = self.tables()?;
        let stored = tables
            .events
            .get_mut(session)
            .and_then(|events| events.iter_mut().find(|e| e.record.event_id == event_id))
            .ok_or_else(|| StoreError::not_found("event", format!("{session}#{event_id}")))?;
        stored.applied = true;
        Ok(())
    }

    async fn list_events(&self, session: &SessionKey) -> StoreResult<Vec<EventRecord>> {
        let tables = self.tables()?;
        let mut events: Vec<EventRecord> = tables
            .events
            .get(session)
            .map(|events| events.iter().map(|e| e.record.clone()).collect())
            .unwrap_or_default();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    async fn insert_artifact(&self, artifact: &ArtifactRecord) -> StoreResult<bool> {
        let mut tables = self.tables()?;
        if tables.artifacts.contains_key(&artifact.artifact_id) {
            return Ok(false);
        }
        tables
            .artifacts
            .insert(artifact.artifact_id.clone(), artifact.clone());
        Ok(true)
    }

    async fn load_artifact(&self, artifact_id: &str) -> StoreResult<Option<ArtifactRecord>> {
        Ok(self.tables()?.artifacts.get(artifact_id).cloned())
    }

    async fn replace_artifact(
        &self,
        artifact: &ArtifactRecord,
        expected_status: ArtifactStatus,
    ) -> StoreResult<bool> {
        let mut tables = self.tables()?;
        match tables.artifacts.get_mut(&artifact.artifact_id) {
            Some(current) if current.status == expected_status => {
                *current = artifact.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_artifacts(&self, session_id: &str) -> StoreResult<Vec<ArtifactRecord>> {
        let tables = self.tables()?;
        let mut artifacts: Vec<ArtifactRecord> = tables
            .artifacts
            .values()
            .filter(|a| a.session_id == session_id)
            .cloned()
            .collect();
        artifacts.sort_by(|a, b| (a.iteration, a.created_at).cmp(&(b.iteration, b.created_at)));
        Ok(artifacts)
    }
}
