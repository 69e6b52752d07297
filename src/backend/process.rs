//! Local execution under an interpreter.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CapturedRun, ExecutionBackend, ExecutionRequest, ExecutionResult, ExecutionStatus, load_work};
use crate::blob::BlobStore;
use crate::errors::BackendError;
use crate::preview::DEFAULT_PREVIEW_CHARS;

/// File name the work unit is written to inside its run directory.
const SCRIPT_NAME: &str = "main";

/// How long to wait for pipe readers once the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs each work unit as `<interpreter> <args..> main` in
/// `<work_dir>/<run_id>/`.
pub struct ProcessBackend {
    blobs: Arc<dyn BlobStore>,
    interpreter: String,
    args: Vec<String>,
    work_dir: PathBuf,
    preview_chars: usize,
}

impl ProcessBackend {
    pub fn new(blobs: Arc<dyn BlobStore>, interpreter: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            blobs,
            interpreter: interpreter.into(),
            args: Vec::new(),
            work_dir: work_dir.into(),
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }
}

/// Bytes read from a pipe so far, shared with the reader task.
type Captured = Arc<Mutex<Vec<u8>>>;

fn drain<R>(reader: Option<R>) -> (Captured, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    let handle = tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => match sink.lock() {
                    Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                    Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
                },
                Err(e) => {
                    debug!(error = %e, "output pipe closed with error");
                    break;
                }
            }
        }
    });
    (captured, handle)
}

/// Wait briefly for the reader to hit EOF, then take whatever it has read.
/// A descendant holding the pipe open only costs the unread remainder.
async fn collect((captured, mut handle): (Captured, JoinHandle<()>)) -> Vec<u8> {
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "output reader task failed"),
        Err(_) => {
            warn!("output pipe still open after child exit, keeping what was read");
            handle.abort();
        }
    }
    let buf = match captured.lock() {
        Ok(mut buf) => std::mem::take(&mut *buf),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    buf
}

/// Kill every process in the child's group, not just the direct child.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers. A negative pid names the group
    // created by `process_group(0)` at spawn.
    let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid = pid, error = %std::io::Error::last_os_error(), "process group kill failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult, BackendError> {
        let code = load_work(self.blobs.as_ref(), request).await?;

        let run_dir = self.work_dir.join(&request.run_id);
        tokio::fs::create_dir_all(&run_dir).await?;
        let script = run_dir.join(SCRIPT_NAME);
        tokio::fs::write(&script, &code).await?;

        let mut command = Command::new(&self.interpreter);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .args(&self.args)
            .arg(SCRIPT_NAME)
            .current_dir(&run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("STAGEHAND_RUN_ID", &request.run_id)
            .env("STAGEHAND_ITERATION", request.iteration.to_string())
            .env("STAGEHAND_PARAMS", request.params.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::SubmitFailed {
                run_id: request.run_id.clone(),
                message: format!("Failed to spawn {}: {}", self.interpreter, e),
            })?;

        let pid = child.id();
        let backend_run_id = format!("process:{}:{}", request.run_id, pid.unwrap_or(0));
        info!(%backend_run_id, interpreter = %self.interpreter, "work unit started");

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let (status, exit_code) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(exit) => {
                let exit = exit?;
                let status = if exit.success() {
                    ExecutionStatus::Succeeded
                } else {
                    ExecutionStatus::Failed
                };
                (status, exit.code())
            }
            Err(_) => {
                warn!(%backend_run_id, timeout_ms = timeout.as_millis() as u64, "work unit timed out, killing");
                kill_group(pid);
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill timed out child");
                }
                (ExecutionStatus::TimedOut, None)
            }
        };

        let captured = CapturedRun {
            status,
            exit_code,
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
            backend_run_id,
        };
        debug!(status = %captured.status, exit_code = ?captured.exit_code, "work unit finished");
        captured.persist(self.blobs.as_ref(), self.preview_chars).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobRef, MemoryBlobStore};

    async fn request_for(blobs: &MemoryBlobStore, code: &str, run_id: &str) -> ExecutionRequest {
        ExecutionRequest {
            work_ref: blobs.put(code.as_bytes()).await.unwrap(),
            run_id: run_id.into(),
            iteration: 1,
            params: serde_json::json!({"rows": 3}),
        }
    }

    async fn read(blobs: &MemoryBlobStore, blob: &BlobRef) -> String {
        String::from_utf8(blobs.get(blob).await.unwrap().unwrap()).unwrap()
    }

    fn backend(blobs: Arc<MemoryBlobStore>, dir: &std::path::Path) -> ProcessBackend {
        ProcessBackend::new(blobs, "sh", dir)
    }

    #[tokio::test]
    async fn successful_run_persists_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let request = request_for(
            &blobs,
            "echo \"iter=$STAGEHAND_ITERATION\"; echo warn >&2",
            "r1",
        )
        .await;

        let result = backend(blobs.clone(), dir.path())
            .execute(&request, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(read(&blobs, &result.stdout_ref).await, "iter=1\n");
        assert_eq!(result.preview_stderr, "warn\n");
        assert!(result.backend_run_id.starts_with("process:r1:"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failed_result_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let request = request_for(&blobs, "echo broken >&2; exit 3", "r2").await;

        let result = backend(blobs.clone(), dir.path())
            .execute(&request, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(read(&blobs, &result.stderr_ref).await, "broken\n");
    }

    #[tokio::test]
    async fn timeout_kills_child_and_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let request = request_for(&blobs, "echo started; exec sleep 30", "r3").await;

        let started = std::time::Instant::now();
        let result = backend(blobs.clone(), dir.path())
            .execute(&request, Duration::from_millis(300))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(read(&blobs, &result.stdout_ref).await, "started\n");
    }

    #[tokio::test]
    async fn timeout_with_background_descendant_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        // `sleep` runs as a grandchild that inherits stdout, so the pipe stays
        // open after the shell itself is killed.
        let request = request_for(&blobs, "echo started; sleep 30", "r5").await;

        let started = std::time::Instant::now();
        let result = backend(blobs.clone(), dir.path())
            .execute(&request, Duration::from_millis(300))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(read(&blobs, &result.stdout_ref).await, "started\n");
        assert_eq!(result.preview_stdout, "started\n");
    }

    #[tokio::test]
    async fn output_written_before_exit_survives_lingering_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        // The shell exits normally but leaves a background writer holding stdout.
        let request = request_for(&blobs, "echo done; sleep 30 &", "r6").await;

        let started = std::time::Instant::now();
        let result = backend(blobs.clone(), dir.path())
            .execute(&request, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(read(&blobs, &result.stdout_ref).await, "done\n");
    }

    #[tokio::test]
    async fn missing_work_blob_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let request = ExecutionRequest {
            work_ref: BlobRef::for_bytes(b"never stored"),
            run_id: "r4".into(),
            iteration: 1,
            params: serde_json::Value::Null,
        };
        let err = backend(blobs, dir.path())
            .execute(&request, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::MissingWork { .. }));
    }
}
