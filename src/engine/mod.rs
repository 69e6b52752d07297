//! Stage-gated orchestration.
//!
//! One iteration walks the invocation gate `None → Delegated → Executed →
//! Processed`. Each stage receives an immutable [`StageContext`] snapshot and
//! returns a [`StageOutcome`]: a state delta to commit plus a [`Control`]
//! signal. The controller commits the delta and switches on the signal; it
//! never inspects which stage produced it.
//!
//! The gate and the active artifact id live only in `temp:` keys, so they
//! vanish with the invocation. A stage whose gate or expected artifact does
//! not match what it finds skips instead of acting on stale state.

pub mod controller;
pub mod stages;

pub use controller::{EngineConfig, OrchestrationEngine, RunOutcome, Termination};
pub use stages::{GeneratorStage, ProcessorStage, SubmitterStage};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_common::{DeltaOp, SessionRecord, StateDelta, StateMap, StateScope};

use crate::errors::WorkflowError;

/// State keys shared by the stages.
pub mod keys {
    pub const STAGE: &str = "temp:stage";
    pub const ACTIVE_ARTIFACT_ID: &str = "temp:active_artifact_id";
    pub const INSTRUCTION: &str = "temp:instruction";
    pub const CODE_REF: &str = "temp:code_ref";
    pub const STDOUT_REF: &str = "temp:stdout_ref";
    pub const STDERR_REF: &str = "temp:stderr_ref";
    pub const STDOUT_PREVIEW: &str = "temp:stdout_preview";
    pub const STDERR_PREVIEW: &str = "temp:stderr_preview";
    pub const EXECUTION_STATUS: &str = "temp:execution_status";
    pub const BACKEND_RUN_ID: &str = "temp:backend_run_id";

    pub const SUMMARY: &str = "summary";
    pub const LAST_ARTIFACT_ID: &str = "last_artifact_id";
    pub const ITERATIONS_COMPLETED: &str = "iterations_completed";
}

/// Per-iteration progress marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageGate {
    None,
    Delegated,
    Executed,
    Processed,
}

impl StageGate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Delegated => "delegated",
            Self::Executed => "executed",
            Self::Processed => "processed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "delegated" => Some(Self::Delegated),
            "executed" => Some(Self::Executed),
            "processed" => Some(Self::Processed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Generator,
    Submitter,
    Processor,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Submitter => "submitter",
            Self::Processor => "processor",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invocation-scoped state. Holds `temp:` keys only and is never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationState(StateMap);

impl InvocationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Current gate; a missing or unrecognized marker reads as `None`.
    pub fn gate(&self) -> StageGate {
        self.get_str(keys::STAGE)
            .and_then(StageGate::parse)
            .unwrap_or(StageGate::None)
    }

    pub fn active_artifact(&self) -> Option<&str> {
        self.get_str(keys::ACTIVE_ARTIFACT_ID)
    }

    /// Apply the invocation-scoped part of `delta`; other keys are ignored.
    pub fn apply(&mut self, delta: &StateDelta) {
        for (key, op) in delta.iter() {
            if StateScope::of(key) != StateScope::Invocation {
                continue;
            }
            match op {
                DeltaOp::Set(value) => {
                    self.0.insert(key.clone(), value.clone());
                }
                DeltaOp::Delete => {
                    self.0.remove(key);
                }
            }
        }
    }

    /// Back to `None` with nothing active, for the next iteration.
    pub fn reset(&mut self) {
        self.0.clear();
    }

    pub fn as_map(&self) -> &StateMap {
        &self.0
    }
}

/// Immutable input to one stage run.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub invocation_id: String,
    pub session: SessionRecord,
    pub invocation: InvocationState,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Artifact this iteration's Generator produced, if it has run.
    pub expected_artifact: Option<String>,
}

impl StageContext {
    /// Whether the active artifact is the one this iteration expects.
    pub fn artifact_matches(&self) -> bool {
        match (self.invocation.active_artifact(), self.expected_artifact.as_deref()) {
            (Some(active), Some(expected)) => active == expected,
            _ => false,
        }
    }
}

/// Changes a stage asks the controller to commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageUpdate {
    pub delta: StateDelta,
    /// Artifact to mark consumed once the delta is durable.
    pub consumed: Option<String>,
    /// Recorded with the stage's event.
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Continue,
    Skip(String),
    Exit(String),
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub update: StageUpdate,
    pub control: Control,
}

impl StageOutcome {
    pub fn advance(update: StageUpdate) -> Self {
        Self {
            update,
            control: Control::Continue,
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            update: StageUpdate::default(),
            control: Control::Skip(reason.into()),
        }
    }

    pub fn exit(update: StageUpdate, reason: impl Into<String>) -> Self {
        Self {
            update,
            control: Control::Exit(reason.into()),
        }
    }

    pub fn fatal(update: StageUpdate, message: impl Into<String>) -> Self {
        Self {
            update,
            control: Control::Fatal(message.into()),
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, WorkflowError>;
}

/// The closed set of pipeline stages.
pub enum PipelineStage {
    Generator(GeneratorStage),
    Submitter(SubmitterStage),
    Processor(ProcessorStage),
}

#[async_trait]
impl Stage for PipelineStage {
    fn kind(&self) -> StageKind {
        match self {
            Self::Generator(_) => StageKind::Generator,
            Self::Submitter(_) => StageKind::Submitter,
            Self::Processor(_) => StageKind::Processor,
        }
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, WorkflowError> {
        match self {
            Self::Generator(stage) => stage.run(ctx).await,
            Self::Submitter(stage) => stage.run(ctx).await,
            Self::Processor(stage) => stage.run(ctx).await,
        }
    }
}
