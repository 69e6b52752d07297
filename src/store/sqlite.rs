use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use stagehand_common::{
    ArtifactRecord, ArtifactStatus, EventRecord, NewEvent, SessionKey, StateDelta, StateMap,
};
use tracing::debug;

use super::{EventInsert, RowKey, StateRow, StateStore, StoreResult, StoredEvent};
use crate::errors::StoreError;

/// SQLite-backed store.
///
/// Wraps a single connection behind `Arc<Mutex>` and runs all access on
/// tokio's blocking thread pool via `spawn_blocking`, so synchronous SQLite
/// I/O never ties up async worker threads. Version and status preconditions
/// are enforced in the `WHERE` clause of each write, not by the mutex.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<std::sync::Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database at the given path and run migrations.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;
        Ok(Self {
            inner: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    /// Run a closure with the connection on a blocking thread.
    async fn call<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&Connection) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow!("DB task panicked: {}", e)))?
    }
}

fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS app_states (
            app_name TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT '{}',
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (app_name)
        );

        CREATE TABLE IF NOT EXISTS user_states (
            app_name TEXT NOT NULL,
            user_id TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT '{}',
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (app_name, user_id)
        );

        CREATE TABLE IF NOT EXISTS sessions (
            app_name TEXT NOT NULL,
            user_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT '{}',
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (app_name, user_id, session_id)
        );

        CREATE TABLE IF NOT EXISTS events (
            app_name TEXT NOT NULL,
            user_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            author TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            state_delta TEXT NOT NULL DEFAULT '{}',
            payload TEXT NOT NULL DEFAULT 'null',
            applied INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (app_name, user_id, session_id, event_id)
        );

        CREATE TABLE IF NOT EXISTS artifacts (
            artifact_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            iteration INTEGER NOT NULL,
            kind TEXT NOT NULL,
            instruction TEXT NOT NULL DEFAULT '',
            code_ref TEXT NOT NULL,
            stdout_ref TEXT,
            stderr_ref TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            consumed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(app_name, user_id);
        CREATE INDEX IF NOT EXISTS idx_events_sequence ON events(app_name, user_id, session_id, sequence);
        CREATE INDEX IF NOT EXISTS idx_artifacts_session ON artifacts(session_id, iteration);
        ",
    )?;
    Ok(())
}

/// Table name, key columns and key values for a state row.
struct RowTable {
    table: &'static str,
    key_columns: &'static [&'static str],
    key_values: Vec<String>,
}

impl RowTable {
    fn of(key: &RowKey) -> Self {
        match key {
            RowKey::App(app) => Self {
                table: "app_states",
                key_columns: &["app_name"],
                key_values: vec![app.clone()],
            },
            RowKey::User { app, user } => Self {
                table: "user_states",
                key_columns: &["app_name", "user_id"],
                key_values: vec![app.clone(), user.clone()],
            },
            RowKey::Session(key) => Self {
                table: "sessions",
                key_columns: &["app_name", "user_id", "session_id"],
                key_values: vec![key.app.clone(), key.user.clone(), key.session.clone()],
            },
        }
    }

    /// `col1 = ?N AND col2 = ?N+1 ...` starting at placeholder `first`.
    fn key_predicate(&self, first: usize) -> String {
        self.key_columns
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{} = ?{}", col, first + i))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn key_params(&self) -> impl Iterator<Item = SqlValue> + '_ {
        self.key_values.iter().map(|v| SqlValue::Text(v.clone()))
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(anyhow!("Invalid timestamp '{}': {}", raw, e)))
}

fn to_json<T: serde::Serialize>(what: &'static str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|source| StoreError::Serialization { what, source })
}

fn from_json<T: serde::de::DeserializeOwned>(what: &'static str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|source| StoreError::Serialization { what, source })
}

fn state_row_params(row: &StateRow) -> StoreResult<Vec<SqlValue>> {
    Ok(vec![
        SqlValue::Text(to_json("state", &row.state)?),
        SqlValue::Integer(row.version as i64),
        SqlValue::Text(format_time(&row.updated_at)),
        SqlValue::Integer(i64::from(row.is_deleted)),
    ])
}

/// Raw columns of a state row, decoded outside the rusqlite row closure.
struct RawStateRow {
    state: String,
    version: i64,
    updated_at: String,
    is_deleted: bool,
}

impl RawStateRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            state: row.get(0)?,
            version: row.get(1)?,
            updated_at: row.get(2)?,
            is_deleted: row.get::<_, i64>(3)? != 0,
        })
    }

    fn decode(self, key: RowKey) -> StoreResult<StateRow> {
        Ok(StateRow {
            key,
            state: from_json::<StateMap>("state", &self.state)?,
            version: self.version as u64,
            updated_at: parse_time(&self.updated_at)?,
            is_deleted: self.is_deleted,
        })
    }
}

struct RawEvent {
    session: SessionKey,
    event_id: String,
    author: String,
    timestamp: String,
    sequence: i64,
    state_delta: String,
    payload: String,
    applied: bool,
}

const EVENT_COLUMNS: &str = "app_name, user_id, session_id, event_id, author, timestamp, sequence, state_delta, payload, applied";

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session: SessionKey::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ),
            event_id: row.get(3)?,
            author: row.get(4)?,
            timestamp: row.get(5)?,
            sequence: row.get(6)?,
            state_delta: row.get(7)?,
            payload: row.get(8)?,
            applied: row.get::<_, i64>(9)? != 0,
        })
    }

    fn decode(self) -> StoreResult<StoredEvent> {
        Ok(StoredEvent {
            record: EventRecord {
                session: self.session,
                event_id: self.event_id,
                author: self.author,
                timestamp: parse_time(&self.timestamp)?,
                sequence: self.sequence as u64,
                state_delta: from_json::<StateDelta>("event delta", &self.state_delta)?,
                payload: from_json("event payload", &self.payload)?,
            },
            applied: self.applied,
        })
    }
}

fn load_event(
    conn: &Connection,
    session: &SessionKey,
    event_id: &str,
) -> StoreResult<Option<StoredEvent>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 AND event_id = ?4"
            ),
            params![session.app, session.user, session.session, event_id],
            RawEvent::from_row,
        )
        .optional()?;
    raw.map(RawEvent::decode).transpose()
}

struct RawArtifact {
    artifact_id: String,
    session_id: String,
    iteration: i64,
    kind: String,
    instruction: String,
    code_ref: String,
    stdout_ref: Option<String>,
    stderr_ref: Option<String>,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    consumed_at: Option<String>,
}

const ARTIFACT_COLUMNS: &str = "artifact_id, session_id, iteration, kind, instruction, code_ref, stdout_ref, stderr_ref, status, error, created_at, updated_at, consumed_at";

impl RawArtifact {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            artifact_id: row.get(0)?,
            session_id: row.get(1)?,
            iteration: row.get(2)?,
            kind: row.get(3)?,
            instruction: row.get(4)?,
            code_ref: row.get(5)?,
            stdout_ref: row.get(6)?,
            stderr_ref: row.get(7)?,
            status: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            consumed_at: row.get(12)?,
        })
    }

    fn decode(self) -> StoreResult<ArtifactRecord> {
        let status = ArtifactStatus::from_str(&self.status)
            .map_err(|e| StoreError::Database(anyhow!(e)))?;
        Ok(ArtifactRecord {
            artifact_id: self.artifact_id,
            session_id: self.session_id,
            iteration: self.iteration as u32,
            kind: self.kind,
            instruction: self.instruction,
            code_ref: self.code_ref,
            stdout_ref: self.stdout_ref,
            stderr_ref: self.stderr_ref,
            status,
            error: self.error,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            consumed_at: self.consumed_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

fn artifact_params(artifact: &ArtifactRecord) -> Vec<SqlValue> {
    let opt = |v: &Option<String>| v.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null);
    vec![
        SqlValue::Text(artifact.artifact_id.clone()),
        SqlValue::Text(artifact.session_id.clone()),
        SqlValue::Integer(i64::from(artifact.iteration)),
        SqlValue::Text(artifact.kind.clone()),
        SqlValue::Text(artifact.instruction.clone()),
        SqlValue::Text(artifact.code_ref.clone()),
        opt(&artifact.stdout_ref),
        opt(&artifact.stderr_ref),
        SqlValue::Text(artifact.status.as_str().to_string()),
        opt(&artifact.error),
        SqlValue::Text(format_time(&artifact.created_at)),
        SqlValue::Text(format_time(&artifact.updated_at)),
        opt(&artifact.consumed_at.as_ref().map(format_time)),
    ]
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load_row(&self, key: &RowKey) -> StoreResult<Option<StateRow>> {
        let key = key.clone();
        self.call(move |conn| {
            let table = RowTable::of(&key);
            let sql = format!(
                "SELECT state, version, updated_at, is_deleted FROM {} WHERE {}",
                table.table,
                table.key_predicate(1)
            );
            let raw = conn
                .query_row(&sql, params_from_iter(table.key_params()), RawStateRow::from_row)
                .optional()?;
            raw.map(|raw| raw.decode(key)).transpose()
        })
        .await
    }

    async fn insert_row(&self, row: &StateRow) -> StoreResult<bool> {
        let row = row.clone();
        self.call(move |conn| {
            let table = RowTable::of(&row.key);
            let columns = table.key_columns.join(", ");
            let n = table.key_columns.len();
            let placeholders = (1..=n + 4)
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO {} ({}, state, version, updated_at, is_deleted) VALUES ({})
                 ON CONFLICT DO NOTHING",
                table.table, columns, placeholders
            );
            let mut values: Vec<SqlValue> = table.key_params().collect();
            values.extend(state_row_params(&row)?);
            let changed = conn.execute(&sql, params_from_iter(values))?;
            Ok(changed == 1)
        })
        .await
    }

    async fn replace_row(&self, row: &StateRow, expected_version: u64) -> StoreResult<bool> {
        let row = row.clone();
        self.call(move |conn| {
            let table = RowTable::of(&row.key);
            let n = table.key_columns.len();
            let sql = format!(
                "UPDATE {} SET state = ?1, version = ?2, updated_at = ?3, is_deleted = ?4
                 WHERE {} AND version = ?{}",
                table.table,
                table.key_predicate(5),
                5 + n
            );
            let mut values = state_row_params(&row)?;
            values.extend(table.key_params());
            values.push(SqlValue::Integer(expected_version as i64));
            let changed = conn.execute(&sql, params_from_iter(values))?;
            if changed == 0 {
                debug!(key = %row.key, expected_version, "version precondition failed");
            }
            Ok(changed == 1)
        })
        .await
    }

    async fn list_session_rows(&self, app: &str, user: &str) -> StoreResult<Vec<StateRow>> {
        let (app, user) = (app.to_string(), user.to_string());
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT state, version, updated_at, is_deleted, session_id FROM sessions
                 WHERE app_name = ?1 AND user_id = ?2",
            )?;
            let raws = stmt
                .query_map(params![app, user], |row| {
                    Ok((RawStateRow::from_row(row)?, row.get::<_, String>(4)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter()
                .map(|(raw, session)| {
                    raw.decode(RowKey::Session(SessionKey::new(&app, &user, session)))
                })
                .collect()
        })
        .await
    }

    async fn insert_event(&self, event: &NewEvent) -> StoreResult<EventInsert> {
        let event = event.clone();
        self.call(move |conn| {
            let delta = to_json("event delta", &event.state_delta)?;
            let payload = to_json("event payload", &event.payload)?;
            // Sequence is assigned in the same statement as the insert.
            let changed = conn.execute(
                "INSERT INTO events (app_name, user_id, session_id, event_id, author, timestamp,
                                     sequence, state_delta, payload, applied)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, COALESCE(MAX(sequence), 0) + 1, ?7, ?8, 0
                 FROM events WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
                 ON CONFLICT (app_name, user_id, session_id, event_id) DO NOTHING",
                params![
                    event.session.app,
                    event.session.user,
                    event.session.session,
                    event.event_id,
                    event.author,
                    format_time(&event.timestamp),
                    delta,
                    payload,
                ],
            )?;
            let stored = load_event(conn, &event.session, &event.event_id)?.ok_or_else(|| {
                StoreError::Database(anyhow!("Event {} vanished after insert", event.event_id))
            })?;
            if changed == 1 {
                Ok(EventInsert::Inserted(stored.record))
            } else {
                Ok(EventInsert::Existing(stored))
            }
        })
        .await
    }

    async fn mark_event_applied(&self, session: &SessionKey, event_id: &str) -> StoreResult<()> {
        let (session, event_id) = (session.clone(), event_id.to_string());
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE events SET applied = 1
                 WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 AND event_id = ?4",
                params![session.app, session.user, session.session, event_id],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("event", format!("{session}#{event_id}")));
            }
            Ok(())
        })
        .await
    }

    async fn list_events(&self, session: &SessionKey) -> StoreResult<Vec<EventRecord>> {
        let session = session.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
                 ORDER BY sequence ASC"
            ))?;
            let raws = stmt
                .query_map(
                    params![session.app, session.user, session.session],
                    RawEvent::from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter()
                .map(|raw| raw.decode().map(|stored| stored.record))
                .collect()
        })
        .await
    }

    async fn insert_artifact(&self, artifact: &ArtifactRecord) -> StoreResult<bool> {
        let values = artifact_params(artifact);
        self.call(move |conn| {
            let changed = conn.execute(
                &format!(
                    "INSERT INTO artifacts ({ARTIFACT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT (artifact_id) DO NOTHING"
                ),
                params_from_iter(values),
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn load_artifact(&self, artifact_id: &str) -> StoreResult<Option<ArtifactRecord>> {
        let artifact_id = artifact_id.to_string();
        self.call(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE artifact_id = ?1"),
                    params![artifact_id],
                    RawArtifact::from_row,
                )
                .optional()?;
            raw.map(RawArtifact::decode).transpose()
        })
        .await
    }

    async fn replace_artifact(
        &self,
        artifact: &ArtifactRecord,
        expected_status: ArtifactStatus,
    ) -> StoreResult<bool> {
        let mut values = artifact_params(artifact);
        values.push(SqlValue::Text(expected_status.as_str().to_string()));
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE artifacts SET
                    session_id = ?2, iteration = ?3, kind = ?4, instruction = ?5, code_ref = ?6,
                    stdout_ref = ?7, stderr_ref = ?8, status = ?9, error = ?10,
                    created_at = ?11, updated_at = ?12, consumed_at = ?13
                 WHERE artifact_id = ?1 AND status = ?14",
                params_from_iter(values),
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn list_artifacts(&self, session_id: &str) -> StoreResult<Vec<ArtifactRecord>> {
        let session_id = session_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ARTIFACT_COLUMNS} FROM artifacts
                 WHERE session_id = ?1 ORDER BY iteration ASC, created_at ASC"
            ))?;
            let raws = stmt
                .query_map(params![session_id], RawArtifact::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(RawArtifact::decode).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> SessionKey {
        SessionKey::new("app", "alice", "s1")
    }

    #[tokio::test]
    async fn state_rows_roundtrip_for_every_scope() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut state = StateMap::new();
        state.insert("k".into(), json!({"nested": [1, 2]}));

        for row_key in [
            RowKey::Session(key()),
            RowKey::user_of(&key()),
            RowKey::app_of(&key()),
        ] {
            let row = StateRow::new(row_key.clone(), state.clone());
            assert!(store.insert_row(&row).await.unwrap());
            assert!(!store.insert_row(&row).await.unwrap());
            let loaded = store.load_row(&row_key).await.unwrap().unwrap();
            assert_eq!(loaded.state, state);
            assert_eq!(loaded.version, 1);
        }
    }

    #[tokio::test]
    async fn replace_row_checks_version_in_sql() {
        let store = SqliteStore::open_in_memory().unwrap();
        let row = StateRow::new(RowKey::Session(key()), StateMap::new());
        store.insert_row(&row).await.unwrap();

        let mut next = row.clone();
        next.version = 2;
        next.is_deleted = true;
        assert!(!store.replace_row(&next, 5).await.unwrap());
        assert!(store.replace_row(&next, 1).await.unwrap());
        // A second writer that also read version 1 loses.
        assert!(!store.replace_row(&next, 1).await.unwrap());

        let loaded = store.load_row(&row.key).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert!(loaded.is_deleted);
    }

    #[tokio::test]
    async fn insert_event_assigns_sequence_and_ignores_duplicates() {
        let store = SqliteStore::open_in_memory().unwrap();
        let e1 = NewEvent::new(key(), "gen")
            .with_event_id("e1")
            .with_delta(StateDelta::new().set("counter", 1).delete("old"));
        let e2 = NewEvent::new(key(), "gen").with_event_id("e2");

        let EventInsert::Inserted(first) = store.insert_event(&e1).await.unwrap() else {
            panic!("Expected Inserted");
        };
        assert_eq!(first.sequence, 1);
        assert_eq!(first.state_delta, e1.state_delta);

        match store.insert_event(&e1).await.unwrap() {
            EventInsert::Existing(stored) => {
                assert!(!stored.applied);
                assert_eq!(stored.record.sequence, 1);
            }
            other => panic!("Expected Existing, got {other:?}"),
        }

        let EventInsert::Inserted(second) = store.insert_event(&e2).await.unwrap() else {
            panic!("Expected Inserted");
        };
        assert_eq!(second.sequence, 2);

        store.mark_event_applied(&key(), "e1").await.unwrap();
        let events = store.list_events(&key()).await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.event_id.as_str()).collect::<Vec<_>>(),
            vec!["e1", "e2"]
        );
        assert!(store.mark_event_applied(&key(), "missing").await.is_err());
    }

    #[tokio::test]
    async fn artifacts_replace_only_from_expected_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let artifact = ArtifactRecord {
            artifact_id: "a1".into(),
            session_id: "s1".into(),
            iteration: 1,
            kind: "python".into(),
            instruction: "count rows".into(),
            code_ref: "sha256:abc".into(),
            stdout_ref: None,
            stderr_ref: None,
            status: ArtifactStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
            consumed_at: None,
        };
        assert!(store.insert_artifact(&artifact).await.unwrap());
        assert!(!store.insert_artifact(&artifact).await.unwrap());

        let mut executing = artifact.clone();
        executing.status = ArtifactStatus::Executing;
        assert!(!store
            .replace_artifact(&executing, ArtifactStatus::Completed)
            .await
            .unwrap());
        assert!(store
            .replace_artifact(&executing, ArtifactStatus::Pending)
            .await
            .unwrap());

        let loaded = store.load_artifact("a1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ArtifactStatus::Executing);
        assert_eq!(store.list_artifacts("s1").await.unwrap().len(), 1);
        assert!(store.load_artifact("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let row = StateRow::new(RowKey::Session(key()), StateMap::new());
            store.insert_row(&row).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store
            .load_row(&RowKey::Session(key()))
            .await
            .unwrap()
            .is_some());
    }
}
