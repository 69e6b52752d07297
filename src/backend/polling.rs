//! Remote execution through a submit/poll transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CapturedRun, ExecutionBackend, ExecutionRequest, ExecutionResult, ExecutionStatus, load_work};
use crate::blob::BlobStore;
use crate::errors::BackendError;
use crate::preview::DEFAULT_PREVIEW_CHARS;

/// What a remote job reports when polled.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Running,
    Finished {
        succeeded: bool,
        exit_code: Option<i32>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
}

/// The wire to a remote execution plane.
#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Submit a job and return the plane's id for it.
    async fn submit(&self, request: &ExecutionRequest, code: &[u8]) -> Result<String, BackendError>;

    async fn poll(&self, backend_run_id: &str) -> Result<JobState, BackendError>;

    /// Best-effort cancellation once the local wait is abandoned.
    async fn cancel(&self, _backend_run_id: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

pub struct PollingBackend<T: JobTransport> {
    transport: T,
    blobs: Arc<dyn BlobStore>,
    poll_interval: Duration,
    max_polls: u32,
    preview_chars: usize,
}

impl<T: JobTransport> PollingBackend<T> {
    pub fn new(transport: T, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            transport,
            blobs,
            poll_interval: Duration::from_secs(2),
            max_polls: 900,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = max_polls.max(1);
        self
    }

    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait]
impl<T: JobTransport> ExecutionBackend for PollingBackend<T> {
    fn name(&self) -> &'static str {
        "polling"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult, BackendError> {
        let code = load_work(self.blobs.as_ref(), request).await?;
        let backend_run_id = self.transport.submit(request, &code).await?;
        info!(%backend_run_id, run_id = %request.run_id, "job submitted");

        let deadline = Instant::now() + timeout;
        for poll in 1..=self.max_polls {
            match self.transport.poll(&backend_run_id).await? {
                JobState::Finished {
                    succeeded,
                    exit_code,
                    stdout,
                    stderr,
                } => {
                    debug!(%backend_run_id, poll, succeeded, "job finished");
                    let status = if succeeded {
                        ExecutionStatus::Succeeded
                    } else {
                        ExecutionStatus::Failed
                    };
                    return CapturedRun {
                        status,
                        exit_code,
                        stdout,
                        stderr,
                        backend_run_id,
                    }
                    .persist(self.blobs.as_ref(), self.preview_chars)
                    .await;
                }
                JobState::Running => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(%backend_run_id, poll, "job still running at timeout");
                        if let Err(e) = self.transport.cancel(&backend_run_id).await {
                            warn!(%backend_run_id, error = %e, "cancel failed; remote job may keep running");
                        }
                        return CapturedRun {
                            status: ExecutionStatus::TimedOut,
                            exit_code: None,
                            stdout: Vec::new(),
                            stderr: Vec::new(),
                            backend_run_id,
                        }
                        .persist(self.blobs.as_ref(), self.preview_chars)
                        .await;
                    }
                    tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
                }
            }
        }

        if let Err(e) = self.transport.cancel(&backend_run_id).await {
            warn!(%backend_run_id, error = %e, "cancel failed after poll budget");
        }
        Err(BackendError::PollBudgetExhausted {
            backend_run_id,
            polls: self.max_polls,
        })
    }
}
