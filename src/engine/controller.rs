//! The bounded loop controller.

use serde::Serialize;
use stagehand_common::{NewEvent, SessionKey};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{Control, InvocationState, PipelineStage, Stage, StageContext, StageKind, StageUpdate};
use crate::artifacts::ArtifactRegistry;
use crate::errors::WorkflowError;
use crate::session::SessionStore;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_iterations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_iterations: 5 }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum Termination {
    /// Every iteration ran to completion without an exit signal or error.
    Success,
    /// A stage explicitly asked to stop.
    ExitRequested { reason: String },
    /// An unrecoverable error stopped the run.
    FatalError { message: String },
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ExitRequested { .. } => "exit_requested",
            Self::FatalError { .. } => "fatal_error",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalError { .. })
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::ExitRequested { reason } => write!(f, "exit_requested: {reason}"),
            Self::FatalError { message } => write!(f, "fatal_error: {message}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub invocation_id: String,
    pub session: SessionKey,
    /// Iterations entered, including the one that ended the run.
    pub iterations: u32,
    pub termination: Termination,
}

pub struct OrchestrationEngine {
    sessions: SessionStore,
    artifacts: ArtifactRegistry,
    stages: Vec<PipelineStage>,
    config: EngineConfig,
}

impl OrchestrationEngine {
    pub fn new(
        sessions: SessionStore,
        artifacts: ArtifactRegistry,
        generator: super::GeneratorStage,
        submitter: super::SubmitterStage,
        processor: super::ProcessorStage,
        config: EngineConfig,
    ) -> Self {
        Self {
            sessions,
            artifacts,
            stages: vec![
                PipelineStage::Generator(generator),
                PipelineStage::Submitter(submitter),
                PipelineStage::Processor(processor),
            ],
            config,
        }
    }

    /// Run the pipeline against a session until it exits, fails or hits
    /// `max_iterations`. Every failure is classified into the outcome.
    #[instrument(skip_all, fields(session = %key))]
    pub async fn run(&self, key: &SessionKey) -> RunOutcome {
        let invocation_id = Uuid::new_v4().to_string();
        info!(%invocation_id, max_iterations = self.config.max_iterations, "run started");

        let mut invocation = InvocationState::new();
        let mut iterations = 0;
        let termination = match self
            .run_iterations(key, &invocation_id, &mut invocation, &mut iterations)
            .await
        {
            Ok(termination) => termination,
            Err(e) => Termination::FatalError {
                message: e.to_string(),
            },
        };

        if let Termination::FatalError { message } = &termination {
            error!(%invocation_id, iterations, %message, "run failed");
            self.fail_active_artifact(&invocation, message).await;
        } else {
            info!(%invocation_id, iterations, termination = termination.as_str(), "run finished");
        }

        RunOutcome {
            invocation_id,
            session: key.clone(),
            iterations,
            termination,
        }
    }

    async fn run_iterations(
        &self,
        key: &SessionKey,
        invocation_id: &str,
        invocation: &mut InvocationState,
        iterations: &mut u32,
    ) -> Result<Termination, WorkflowError> {
        for iteration in 1..=self.config.max_iterations {
            *iterations = iteration;
            invocation.reset();
            let mut expected_artifact: Option<String> = None;

            for stage in &self.stages {
                let ctx = StageContext {
                    invocation_id: invocation_id.to_string(),
                    session: self.sessions.get(key).await?,
                    invocation: invocation.clone(),
                    iteration,
                    max_iterations: self.config.max_iterations,
                    expected_artifact: expected_artifact.clone(),
                };
                let outcome = stage.run(&ctx).await?;

                if let Control::Skip(reason) = &outcome.control {
                    warn!(stage = %stage.kind(), iteration, %reason, "stage skipped");
                    continue;
                }

                self.commit(key, invocation_id, iteration, stage.kind(), invocation, &outcome.update)
                    .await?;
                if stage.kind() == StageKind::Generator {
                    expected_artifact = invocation.active_artifact().map(str::to_string);
                }

                match outcome.control {
                    Control::Continue | Control::Skip(_) => {}
                    Control::Exit(reason) => return Ok(Termination::ExitRequested { reason }),
                    Control::Fatal(message) => return Ok(Termination::FatalError { message }),
                }
            }
        }
        Ok(Termination::Success)
    }

    /// Apply a stage's update: invocation keys in memory, durable keys as an
    /// event, then the consumed marker.
    async fn commit(
        &self,
        key: &SessionKey,
        invocation_id: &str,
        iteration: u32,
        kind: StageKind,
        invocation: &mut InvocationState,
        update: &StageUpdate,
    ) -> Result<(), WorkflowError> {
        invocation.apply(&update.delta);

        // Deterministic id: replaying the same stage turn cannot apply twice.
        let event = NewEvent::new(key.clone(), kind.as_str())
            .with_event_id(format!("{invocation_id}:{iteration}:{kind}"))
            .with_delta(update.delta.clone())
            .with_payload(update.payload.clone());
        self.sessions.append_event(key, event).await?;

        if let Some(artifact_id) = &update.consumed {
            self.artifacts.mark_consumed(artifact_id).await?;
        }
        Ok(())
    }

    async fn fail_active_artifact(&self, invocation: &InvocationState, message: &str) {
        let Some(artifact_id) = invocation.active_artifact() else {
            return;
        };
        match self.artifacts.fail_unfinished(artifact_id, message).await {
            Ok(record) => info!(%artifact_id, status = %record.status, "active artifact settled"),
            Err(e) => warn!(%artifact_id, error = %e, "could not mark active artifact failed"),
        }
    }
}
