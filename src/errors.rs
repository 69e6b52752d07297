//! Typed error hierarchy for stagehand.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError`: session, event and artifact persistence
//! - `BackendError`: execution backends and the blob store they write to
//! - `WorkflowError`: stage and orchestration failures

use std::time::Duration;

use stagehand_common::ArtifactStatus;
use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} already exists")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("Concurrent update conflict on {id} after {attempts} attempts")]
    Conflict { id: String, attempts: u32 },

    #[error("Event targets session {event_session} but was appended to {target}")]
    SessionMismatch {
        target: String,
        event_session: String,
    },

    #[error("Artifact {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ArtifactStatus,
        to: ArtifactStatus,
    },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Failed to (de)serialize stored {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.into())
    }
}

/// Errors from execution backends.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Execution of {run_id} exceeded {timeout:?}")]
    Timeout { run_id: String, timeout: Duration },

    #[error("Failed to submit {run_id}: {message}")]
    SubmitFailed { run_id: String, message: String },

    #[error("Gave up on {backend_run_id} after {polls} polls")]
    PollBudgetExhausted { backend_run_id: String, polls: u32 },

    #[error("Work unit {work_ref} is not in the blob store")]
    MissingWork { work_ref: String },

    #[error("Blob store error: {0}")]
    Blob(#[source] anyhow::Error),

    #[error("Execution I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that terminate an orchestration run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{stage} agent chain exhausted after {attempts} attempts: {message}")]
    AgentExhausted {
        stage: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("Blob store error: {0}")]
    Blob(#[source] anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Fatal workflow error: {0}")]
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_not_found_carries_entity_and_id() {
        let err = StoreError::not_found("session", "app/u/s1");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "session app/u/s1 not found");
    }

    #[test]
    fn store_error_conflict_reports_attempts() {
        let err = StoreError::Conflict {
            id: "app/u/s1".into(),
            attempts: 5,
        };
        match &err {
            StoreError::Conflict { attempts, .. } => assert_eq!(*attempts, 5),
            _ => panic!("Expected Conflict"),
        }
        assert!(err.to_string().contains("5 attempts"));
    }

    #[test]
    fn invalid_transition_names_both_statuses() {
        let err = StoreError::InvalidTransition {
            id: "a1".into(),
            from: ArtifactStatus::Consumed,
            to: ArtifactStatus::Completed,
        };
        let msg = err.to_string();
        assert!(msg.contains("consumed"));
        assert!(msg.contains("completed"));
    }

    #[test]
    fn workflow_error_converts_from_store_and_backend() {
        let wf: WorkflowError = StoreError::LockPoisoned.into();
        assert!(matches!(wf, WorkflowError::Store(StoreError::LockPoisoned)));

        let wf: WorkflowError = BackendError::Timeout {
            run_id: "r".into(),
            timeout: Duration::from_secs(3),
        }
        .into();
        assert!(matches!(
            wf,
            WorkflowError::Backend(BackendError::Timeout { .. })
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::LockPoisoned);
        assert_std_error(&BackendError::MissingWork {
            work_ref: "sha256:00".into(),
        });
        assert_std_error(&WorkflowError::Fatal("x".into()));
    }
}
