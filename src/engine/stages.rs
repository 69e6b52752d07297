//! The three pipeline stages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use stagehand_common::{ArtifactRecord, ArtifactStatus, StateDelta};
use tracing::{info, instrument, warn};

use super::{Stage, StageContext, StageGate, StageKind, StageOutcome, StageUpdate, keys};
use crate::agent::{Decision, DigestRequest, DigesterChain, Plan, PlanRequest, PlannerChain};
use crate::artifacts::{ArtifactRegistry, ArtifactUpdate};
use crate::backend::{ExecutionBackend, ExecutionRequest, ExecutionResult, ExecutionStatus, submit_and_wait};
use crate::blob::{BlobRef, BlobStore};
use crate::errors::WorkflowError;
use crate::preview::{DEFAULT_PREVIEW_CHARS, resolve_output, truncate_preview};

fn gate_mismatch(kind: StageKind, found: StageGate, wanted: StageGate) -> StageOutcome {
    StageOutcome::skip(format!("{kind} expects stage {wanted}, found {found}"))
}

fn artifact_mismatch(ctx: &StageContext) -> StageOutcome {
    StageOutcome::skip(format!(
        "active artifact {} does not match expected {}",
        ctx.invocation.active_artifact().unwrap_or("<none>"),
        ctx.expected_artifact.as_deref().unwrap_or("<none>")
    ))
}

/// Asks the planner for the next work unit and registers it.
pub struct GeneratorStage {
    planner: PlannerChain,
    artifacts: ArtifactRegistry,
    blobs: Arc<dyn BlobStore>,
    preview_chars: usize,
}

impl GeneratorStage {
    pub fn new(planner: PlannerChain, artifacts: ArtifactRegistry, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            planner,
            artifacts,
            blobs,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }
}

#[async_trait]
impl Stage for GeneratorStage {
    fn kind(&self) -> StageKind {
        StageKind::Generator
    }

    #[instrument(skip_all, fields(iteration = ctx.iteration))]
    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, WorkflowError> {
        let gate = ctx.invocation.gate();
        if gate != StageGate::None {
            return Ok(gate_mismatch(self.kind(), gate, StageGate::None));
        }

        let session_id = ctx.session.key.to_string();
        let request = PlanRequest {
            session_id: session_id.clone(),
            iteration: ctx.iteration,
            max_iterations: ctx.max_iterations,
            summary: ctx.session.get_str(keys::SUMMARY).map(str::to_string),
            state: ctx.session.state.clone(),
        };

        let unit = match self.planner.plan(&request).await? {
            Plan::Work(unit) => unit,
            Plan::Exit { reason } => {
                info!(%reason, "planner requested exit");
                return Ok(StageOutcome::exit(
                    StageUpdate {
                        payload: json!({"plan": "exit", "reason": reason}),
                        ..Default::default()
                    },
                    reason,
                ));
            }
            Plan::Escalate { reason } => {
                return Ok(StageOutcome::fatal(
                    StageUpdate {
                        payload: json!({"plan": "escalate", "reason": reason}),
                        ..Default::default()
                    },
                    format!("escalated: {reason}"),
                ));
            }
        };

        let code_ref = self
            .blobs
            .put(unit.code.as_bytes())
            .await
            .map_err(WorkflowError::Blob)?;
        let artifact_id = self
            .artifacts
            .create(
                &session_id,
                ctx.iteration,
                &unit.kind,
                &unit.instruction,
                code_ref.as_str(),
            )
            .await?;
        info!(%artifact_id, kind = %unit.kind, "work unit delegated");

        let delta = StateDelta::new()
            .set(keys::STAGE, StageGate::Delegated.as_str())
            .set(keys::ACTIVE_ARTIFACT_ID, artifact_id.as_str())
            .set(keys::INSTRUCTION, truncate_preview(&unit.instruction, self.preview_chars))
            .set(keys::CODE_REF, code_ref.as_str());
        Ok(StageOutcome::advance(StageUpdate {
            delta,
            consumed: None,
            payload: json!({
                "plan": "work",
                "artifact_id": artifact_id,
                "kind": unit.kind,
                "code_ref": code_ref,
                "params": unit.params,
            }),
        }))
    }
}

/// Runs the active artifact on the execution backend.
pub struct SubmitterStage {
    backend: Arc<dyn ExecutionBackend>,
    artifacts: ArtifactRegistry,
    timeout: Duration,
}

impl SubmitterStage {
    pub fn new(backend: Arc<dyn ExecutionBackend>, artifacts: ArtifactRegistry, timeout: Duration) -> Self {
        Self {
            backend,
            artifacts,
            timeout,
        }
    }

    async fn execute(&self, ctx: &StageContext, artifact: &ArtifactRecord) -> Result<StageOutcome, WorkflowError> {
        let work_ref: BlobRef = artifact
            .code_ref
            .parse()
            .map_err(|e| WorkflowError::Fatal(format!("artifact {} has a bad code ref: {e}", artifact.artifact_id)))?;
        self.artifacts
            .update(&artifact.artifact_id, ArtifactUpdate::status(ArtifactStatus::Executing))
            .await?;

        let request = ExecutionRequest {
            work_ref,
            run_id: artifact.artifact_id.clone(),
            iteration: ctx.iteration,
            params: json!({"invocation_id": ctx.invocation_id, "kind": artifact.kind}),
        };
        let result = submit_and_wait(self.backend.as_ref(), &request, self.timeout).await?;

        let update = match result.status {
            ExecutionStatus::Succeeded => ArtifactUpdate::status(ArtifactStatus::Completed),
            ExecutionStatus::Failed => ArtifactUpdate::failed(format!(
                "execution failed with exit code {}",
                result.exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
            )),
            ExecutionStatus::TimedOut => {
                ArtifactUpdate::failed(format!("execution timed out after {}s", self.timeout.as_secs()))
            }
        }
        .with_outputs(
            Some(result.stdout_ref.to_string()),
            Some(result.stderr_ref.to_string()),
        );
        self.artifacts.update(&artifact.artifact_id, update).await?;
        info!(artifact_id = %artifact.artifact_id, status = %result.status, "work unit executed");

        Ok(executed(&result))
    }
}

fn executed(result: &ExecutionResult) -> StageOutcome {
    let delta = StateDelta::new()
        .set(keys::STAGE, StageGate::Executed.as_str())
        .set(keys::STDOUT_REF, result.stdout_ref.as_str())
        .set(keys::STDERR_REF, result.stderr_ref.as_str())
        .set(keys::STDOUT_PREVIEW, result.preview_stdout.as_str())
        .set(keys::STDERR_PREVIEW, result.preview_stderr.as_str())
        .set(keys::EXECUTION_STATUS, result.status.as_str())
        .set(keys::BACKEND_RUN_ID, result.backend_run_id.as_str());
    StageOutcome::advance(StageUpdate {
        delta,
        consumed: None,
        payload: json!({
            "status": result.status,
            "exit_code": result.exit_code,
            "backend_run_id": result.backend_run_id,
            "stdout_ref": result.stdout_ref,
            "stderr_ref": result.stderr_ref,
        }),
    })
}

/// State for an artifact whose execution already finished before this
/// submitter saw it. Pointers are reused; previews are empty.
fn already_executed(artifact: &ArtifactRecord) -> StageOutcome {
    let status = match artifact.status {
        ArtifactStatus::Completed => ExecutionStatus::Succeeded,
        _ => ExecutionStatus::Failed,
    };
    let mut delta = StateDelta::new()
        .set(keys::STAGE, StageGate::Executed.as_str())
        .set(keys::STDOUT_PREVIEW, "")
        .set(keys::STDERR_PREVIEW, artifact.error.clone().unwrap_or_default())
        .set(keys::EXECUTION_STATUS, status.as_str());
    if let Some(stdout_ref) = &artifact.stdout_ref {
        delta = delta.set(keys::STDOUT_REF, stdout_ref.as_str());
    }
    if let Some(stderr_ref) = &artifact.stderr_ref {
        delta = delta.set(keys::STDERR_REF, stderr_ref.as_str());
    }
    StageOutcome::advance(StageUpdate {
        delta,
        consumed: None,
        payload: json!({"status": status, "reused": true}),
    })
}

#[async_trait]
impl Stage for SubmitterStage {
    fn kind(&self) -> StageKind {
        StageKind::Submitter
    }

    #[instrument(skip_all, fields(iteration = ctx.iteration))]
    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, WorkflowError> {
        let gate = ctx.invocation.gate();
        if gate != StageGate::Delegated {
            return Ok(gate_mismatch(self.kind(), gate, StageGate::Delegated));
        }
        if !ctx.artifact_matches() {
            return Ok(artifact_mismatch(ctx));
        }
        let Some(artifact_id) = ctx.invocation.active_artifact() else {
            return Ok(artifact_mismatch(ctx));
        };

        let artifact = self.artifacts.get(artifact_id).await?;
        match artifact.status {
            ArtifactStatus::Pending => self.execute(ctx, &artifact).await,
            ArtifactStatus::Completed | ArtifactStatus::Failed => {
                warn!(%artifact_id, status = %artifact.status, "artifact already executed, not resubmitting");
                Ok(already_executed(&artifact))
            }
            ArtifactStatus::Executing => {
                warn!(%artifact_id, "artifact left executing by an earlier submission");
                let failed = self
                    .artifacts
                    .update(
                        artifact_id,
                        ArtifactUpdate::failed("prior submission outcome unknown"),
                    )
                    .await?;
                Ok(already_executed(&failed))
            }
            ArtifactStatus::Consumed => Ok(StageOutcome::skip(format!(
                "artifact {artifact_id} was already consumed"
            ))),
        }
    }
}

/// Digests execution output into the durable summary.
pub struct ProcessorStage {
    digester: DigesterChain,
    blobs: Arc<dyn BlobStore>,
}

impl ProcessorStage {
    pub fn new(digester: DigesterChain, blobs: Arc<dyn BlobStore>) -> Self {
        Self { digester, blobs }
    }
}

#[async_trait]
impl Stage for ProcessorStage {
    fn kind(&self) -> StageKind {
        StageKind::Processor
    }

    #[instrument(skip_all, fields(iteration = ctx.iteration))]
    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, WorkflowError> {
        let gate = ctx.invocation.gate();
        if gate != StageGate::Executed {
            return Ok(gate_mismatch(self.kind(), gate, StageGate::Executed));
        }
        if !ctx.artifact_matches() {
            return Ok(artifact_mismatch(ctx));
        }
        let Some(artifact_id) = ctx.invocation.active_artifact() else {
            return Ok(artifact_mismatch(ctx));
        };

        let inv = &ctx.invocation;
        let stdout = resolve_output(
            self.blobs.as_ref(),
            inv.get_str(keys::STDOUT_REF),
            inv.get_str(keys::STDOUT_PREVIEW).unwrap_or_default(),
        )
        .await;
        let stderr = resolve_output(
            self.blobs.as_ref(),
            inv.get_str(keys::STDERR_REF),
            inv.get_str(keys::STDERR_PREVIEW).unwrap_or_default(),
        )
        .await;

        let request = DigestRequest {
            session_id: ctx.session.key.to_string(),
            iteration: ctx.iteration,
            artifact_id: artifact_id.to_string(),
            instruction: inv.get_str(keys::INSTRUCTION).unwrap_or_default().to_string(),
            execution_status: inv
                .get_str(keys::EXECUTION_STATUS)
                .unwrap_or(ExecutionStatus::Failed.as_str())
                .to_string(),
            output_truncated: stdout.from_preview || stderr.from_preview,
            stdout: stdout.text,
            stderr: stderr.text,
            previous_summary: ctx.session.get_str(keys::SUMMARY).map(str::to_string),
        };
        let digest = self.digester.digest(&request).await?;

        let completed = ctx
            .session
            .get(keys::ITERATIONS_COMPLETED)
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
            + 1;
        let update = StageUpdate {
            delta: StateDelta::new()
                .set(keys::STAGE, StageGate::Processed.as_str())
                .set(keys::SUMMARY, digest.summary.as_str())
                .set(keys::LAST_ARTIFACT_ID, artifact_id)
                .set(keys::ITERATIONS_COMPLETED, completed),
            consumed: Some(artifact_id.to_string()),
            payload: json!({
                "artifact_id": artifact_id,
                "decision": digest.decision,
                "reason": digest.reason,
                "output_truncated": request.output_truncated,
            }),
        };
        info!(%artifact_id, decision = ?digest.decision, "output digested");

        let reason = digest.reason.unwrap_or_default();
        Ok(match digest.decision {
            Decision::Continue => StageOutcome::advance(update),
            Decision::Exit => {
                let reason = if reason.is_empty() {
                    "processor requested exit".to_string()
                } else {
                    reason
                };
                StageOutcome::exit(update, reason)
            }
            Decision::Escalate => StageOutcome::fatal(update, format!("escalated: {reason}")),
        })
    }
}
