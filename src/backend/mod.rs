//! Execution backends.
//!
//! A backend takes a work unit already stored as a blob, runs it somewhere,
//! and returns pointers to the full output plus bounded previews. Output is
//! persisted on every path, including failure and timeout.
//!
//! - [`ProcessBackend`]: runs the work locally under an interpreter
//! - [`PollingBackend`]: submits to a remote plane through a [`JobTransport`]
//!   and polls for a terminal state

pub mod polling;
pub mod process;

pub use polling::{JobState, JobTransport, PollingBackend};
pub use process::ProcessBackend;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::blob::{BlobRef, BlobStore};
use crate::errors::BackendError;
use crate::preview::store_with_preview;

/// Extra time a backend gets past its own timeout before the caller stops waiting.
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub work_ref: BlobRef,
    pub run_id: String,
    pub iteration: u32,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout_ref: BlobRef,
    pub stderr_ref: BlobRef,
    pub preview_stdout: String,
    pub preview_stderr: String,
    pub backend_run_id: String,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the work unit, returning within roughly `timeout`.
    ///
    /// Running past the timeout is reported as [`ExecutionStatus::TimedOut`]
    /// with whatever output was captured, not as an error.
    async fn execute(
        &self,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult, BackendError>;
}

/// Run `request` on `backend`, never waiting longer than `timeout` plus
/// [`TIMEOUT_GRACE`].
pub async fn submit_and_wait(
    backend: &dyn ExecutionBackend,
    request: &ExecutionRequest,
    timeout: Duration,
) -> Result<ExecutionResult, BackendError> {
    wait_with_grace(backend, request, timeout, TIMEOUT_GRACE).await
}

#[instrument(skip_all, fields(backend = backend.name(), run_id = %request.run_id, timeout_ms = timeout.as_millis() as u64))]
pub(crate) async fn wait_with_grace(
    backend: &dyn ExecutionBackend,
    request: &ExecutionRequest,
    timeout: Duration,
    grace: Duration,
) -> Result<ExecutionResult, BackendError> {
    match tokio::time::timeout(timeout + grace, backend.execute(request, timeout)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("backend did not return within its timeout, abandoning wait");
            Err(BackendError::Timeout {
                run_id: request.run_id.clone(),
                timeout,
            })
        }
    }
}

/// Load the code for a request from the blob store.
pub(crate) async fn load_work(
    blobs: &dyn BlobStore,
    request: &ExecutionRequest,
) -> Result<Vec<u8>, BackendError> {
    blobs
        .get(&request.work_ref)
        .await
        .map_err(BackendError::Blob)?
        .ok_or_else(|| BackendError::MissingWork {
            work_ref: request.work_ref.to_string(),
        })
}

/// Raw output of a finished (or abandoned) run.
pub(crate) struct CapturedRun {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub backend_run_id: String,
}

impl CapturedRun {
    /// Persist both streams and build the pointer/preview result.
    pub async fn persist(
        self,
        blobs: &dyn BlobStore,
        preview_chars: usize,
    ) -> Result<ExecutionResult, BackendError> {
        let (stdout_ref, preview_stdout) = store_with_preview(blobs, &self.stdout, preview_chars)
            .await
            .map_err(BackendError::Blob)?;
        let (stderr_ref, preview_stderr) = store_with_preview(blobs, &self.stderr, preview_chars)
            .await
            .map_err(BackendError::Blob)?;
        Ok(ExecutionResult {
            status: self.status,
            exit_code: self.exit_code,
            stdout_ref,
            stderr_ref,
            preview_stdout,
            preview_stderr,
            backend_run_id: self.backend_run_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Hang;

    #[async_trait]
    impl ExecutionBackend for Hang {
        fn name(&self) -> &'static str {
            "hang"
        }

        async fn execute(
            &self,
            _request: &ExecutionRequest,
            _timeout: Duration,
        ) -> Result<ExecutionResult, BackendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("sleep outlives the test")
        }
    }

    #[tokio::test]
    async fn outer_timeout_bounds_a_misbehaving_backend() {
        let request = ExecutionRequest {
            work_ref: BlobRef::for_bytes(b"x"),
            run_id: "r1".into(),
            iteration: 1,
            params: serde_json::Value::Null,
        };
        let started = std::time::Instant::now();
        let err = wait_with_grace(
            &Hang,
            &request,
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackendError::Timeout { ref run_id, .. } if run_id == "r1"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn execution_status_strings() {
        assert_eq!(ExecutionStatus::TimedOut.as_str(), "timed_out");
        assert!(ExecutionStatus::Succeeded.is_success());
        assert!(!ExecutionStatus::Failed.is_success());
    }
}
