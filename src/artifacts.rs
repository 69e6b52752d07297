//! Artifact lifecycle registry.
//!
//! Records hold metadata and blob references only. Status writes are
//! compare-and-swap on the status that was read, so two writers racing on
//! the same artifact can never move it backwards.

use std::sync::Arc;

use chrono::Utc;
use stagehand_common::{ArtifactRecord, ArtifactStatus};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::preview::{DEFAULT_PREVIEW_CHARS, truncate_preview};
use crate::store::{StateStore, StoreResult};

const MAX_ATTEMPTS: u32 = 5;

/// A status change plus whatever the new status brings with it.
///
/// `None` reference fields keep the stored value.
#[derive(Debug, Clone)]
pub struct ArtifactUpdate {
    pub status: ArtifactStatus,
    pub stdout_ref: Option<String>,
    pub stderr_ref: Option<String>,
    pub error: Option<String>,
}

impl ArtifactUpdate {
    pub fn status(status: ArtifactStatus) -> Self {
        Self {
            status,
            stdout_ref: None,
            stderr_ref: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::status(ArtifactStatus::Failed)
        }
    }

    pub fn with_outputs(mut self, stdout_ref: Option<String>, stderr_ref: Option<String>) -> Self {
        self.stdout_ref = stdout_ref;
        self.stderr_ref = stderr_ref;
        self
    }
}

#[derive(Clone)]
pub struct ArtifactRegistry {
    store: Arc<dyn StateStore>,
    instruction_chars: usize,
}

impl ArtifactRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            instruction_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    pub fn with_instruction_chars(mut self, chars: usize) -> Self {
        self.instruction_chars = chars;
        self
    }

    /// Register a new `pending` artifact and return its id.
    #[instrument(skip(self, instruction, code_ref))]
    pub async fn create(
        &self,
        session_id: &str,
        iteration: u32,
        kind: &str,
        instruction: &str,
        code_ref: &str,
    ) -> StoreResult<String> {
        let now = Utc::now();
        let record = ArtifactRecord {
            artifact_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            iteration,
            kind: kind.to_string(),
            instruction: truncate_preview(instruction, self.instruction_chars),
            code_ref: code_ref.to_string(),
            stdout_ref: None,
            stderr_ref: None,
            status: ArtifactStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
            consumed_at: None,
        };
        if !self.store.insert_artifact(&record).await? {
            return Err(StoreError::AlreadyExists {
                entity: "artifact",
                id: record.artifact_id,
            });
        }
        info!(artifact_id = %record.artifact_id, "artifact registered");
        Ok(record.artifact_id)
    }

    pub async fn get(&self, artifact_id: &str) -> StoreResult<ArtifactRecord> {
        self.store
            .load_artifact(artifact_id)
            .await?
            .ok_or_else(|| StoreError::not_found("artifact", artifact_id))
    }

    /// Move an artifact to `update.status`, rejecting any transition the
    /// lifecycle does not allow.
    #[instrument(skip(self, update), fields(to = %update.status))]
    pub async fn update(&self, artifact_id: &str, update: ArtifactUpdate) -> StoreResult<ArtifactRecord> {
        for attempt in 1..=MAX_ATTEMPTS {
            let current = self.get(artifact_id).await?;
            if !current.status.can_transition_to(update.status) {
                return Err(StoreError::InvalidTransition {
                    id: artifact_id.to_string(),
                    from: current.status,
                    to: update.status,
                });
            }

            let now = Utc::now();
            let mut next = current.clone();
            next.status = update.status;
            next.updated_at = now;
            if update.stdout_ref.is_some() {
                next.stdout_ref = update.stdout_ref.clone();
            }
            if update.stderr_ref.is_some() {
                next.stderr_ref = update.stderr_ref.clone();
            }
            if update.error.is_some() {
                next.error = update.error.clone();
            }
            if update.status == ArtifactStatus::Consumed {
                next.consumed_at = Some(now);
            }

            if self.store.replace_artifact(&next, current.status).await? {
                debug!(from = %current.status, "artifact transitioned");
                return Ok(next);
            }
            warn!(attempt, "artifact status changed underneath us, retrying");
        }
        Err(StoreError::Conflict {
            id: format!("artifact {artifact_id}"),
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Mark a finished artifact consumed. Already consumed is a logged no-op.
    pub async fn mark_consumed(&self, artifact_id: &str) -> StoreResult<ArtifactRecord> {
        let current = self.get(artifact_id).await?;
        if current.status == ArtifactStatus::Consumed {
            warn!(artifact_id, "artifact already consumed");
            return Ok(current);
        }
        match self
            .update(artifact_id, ArtifactUpdate::status(ArtifactStatus::Consumed))
            .await
        {
            Err(StoreError::InvalidTransition {
                from: ArtifactStatus::Consumed,
                ..
            }) => {
                warn!(artifact_id, "artifact consumed concurrently");
                self.get(artifact_id).await
            }
            other => other,
        }
    }

    /// Fail an artifact that has not finished yet. Finished artifacts are
    /// returned unchanged.
    pub async fn fail_unfinished(
        &self,
        artifact_id: &str,
        error: &str,
    ) -> StoreResult<ArtifactRecord> {
        let current = self.get(artifact_id).await?;
        if current.status.is_finished() {
            return Ok(current);
        }
        self.update(artifact_id, ArtifactUpdate::failed(error)).await
    }

    /// Artifacts of a session ordered by iteration, then creation time.
    pub async fn list_for_session(&self, session_id: &str) -> StoreResult<Vec<ArtifactRecord>> {
        self.store.list_artifacts(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> ArtifactRegistry {
        ArtifactRegistry::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn full_lifecycle_records_outputs_and_consumption() {
        let reg = registry();
        let id = reg.create("s1", 1, "python", "count", "sha256:code").await.unwrap();
        assert_eq!(reg.get(&id).await.unwrap().status, ArtifactStatus::Pending);

        reg.update(&id, ArtifactUpdate::status(ArtifactStatus::Executing))
            .await
            .unwrap();
        let done = reg
            .update(
                &id,
                ArtifactUpdate::status(ArtifactStatus::Completed)
                    .with_outputs(Some("sha256:out".into()), Some("sha256:err".into())),
            )
            .await
            .unwrap();
        assert_eq!(done.stdout_ref.as_deref(), Some("sha256:out"));

        let consumed = reg.mark_consumed(&id).await.unwrap();
        assert_eq!(consumed.status, ArtifactStatus::Consumed);
        assert!(consumed.consumed_at.is_some());
        // References survive the consumed transition.
        assert_eq!(consumed.stderr_ref.as_deref(), Some("sha256:err"));
    }

    #[tokio::test]
    async fn backward_transition_is_rejected() {
        let reg = registry();
        let id = reg.create("s1", 1, "python", "x", "sha256:c").await.unwrap();
        reg.update(&id, ArtifactUpdate::status(ArtifactStatus::Executing))
            .await
            .unwrap();
        let err = reg
            .update(&id, ArtifactUpdate::status(ArtifactStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn mark_consumed_twice_is_a_no_op() {
        let reg = registry();
        let id = reg.create("s1", 1, "python", "x", "sha256:c").await.unwrap();
        reg.update(&id, ArtifactUpdate::failed("boom")).await.unwrap();
        let first = reg.mark_consumed(&id).await.unwrap();
        let second = reg.mark_consumed(&id).await.unwrap();
        assert_eq!(first.consumed_at, second.consumed_at);
        assert_eq!(second.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn consuming_before_execution_finishes_is_rejected() {
        let reg = registry();
        let id = reg.create("s1", 1, "python", "x", "sha256:c").await.unwrap();
        assert!(reg.mark_consumed(&id).await.is_err());
    }

    #[tokio::test]
    async fn fail_unfinished_leaves_finished_artifacts_alone() {
        let reg = registry();
        let pending = reg.create("s1", 1, "python", "x", "sha256:c").await.unwrap();
        let failed = reg.fail_unfinished(&pending, "crashed").await.unwrap();
        assert_eq!(failed.status, ArtifactStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("crashed"));

        let again = reg.fail_unfinished(&pending, "other").await.unwrap();
        assert_eq!(again.error.as_deref(), Some("crashed"));
    }

    #[tokio::test]
    async fn long_instructions_are_truncated() {
        let reg = registry().with_instruction_chars(10);
        let id = reg
            .create("s1", 1, "python", &"x".repeat(50), "sha256:c")
            .await
            .unwrap();
        let record = reg.get(&id).await.unwrap();
        assert!(record.instruction.starts_with("xxxxxxxxxx"));
        assert!(record.instruction.contains("truncated 40 chars"));
    }

    #[tokio::test]
    async fn list_is_ordered_by_iteration() {
        let reg = registry();
        reg.create("s1", 2, "python", "b", "sha256:b").await.unwrap();
        reg.create("s1", 1, "python", "a", "sha256:a").await.unwrap();
        reg.create("s2", 1, "python", "z", "sha256:z").await.unwrap();
        let listed = reg.list_for_session("s1").await.unwrap();
        let iterations: Vec<u32> = listed.iter().map(|a| a.iteration).collect();
        assert_eq!(iterations, vec![1, 2]);
    }
}
