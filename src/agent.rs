//! Language-model collaborators behind the Generator and Processor stages.
//!
//! The model call is opaque: a [`Planner`] turns the durable summary into the
//! next work unit (or a decision to stop), and a [`Digester`] turns execution
//! output into a new summary plus a decision. Both may fail; each stage holds
//! an ordered fallback chain and only gives up once every agent in it has
//! exhausted its attempts.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_common::StateMap;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::errors::WorkflowError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub session_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Durable summary left by the previous iteration's Processor.
    pub summary: Option<String>,
    /// Durable session state (session, `user:` and `app:` keys).
    pub state: StateMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub kind: String,
    pub instruction: String,
    pub code: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Plan {
    Work(WorkUnit),
    Exit { reason: String },
    Escalate { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestRequest {
    pub session_id: String,
    pub iteration: u32,
    pub artifact_id: String,
    pub instruction: String,
    pub execution_status: String,
    pub stdout: String,
    pub stderr: String,
    /// `stdout`/`stderr` are previews because the full output was unavailable.
    pub output_truncated: bool,
    pub previous_summary: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Continue,
    Exit,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub summary: String,
    #[serde(default)]
    pub decision: Decision,
    #[serde(default)]
    pub reason: Option<String>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan>;
}

#[async_trait]
pub trait Digester: Send + Sync {
    async fn digest(&self, request: &DigestRequest) -> Result<Digest>;
}

/// Try each agent in order, each up to `attempts` times.
async fn run_chain<A, T, F, Fut>(
    stage: &'static str,
    agents: &[Arc<A>],
    attempts: u32,
    mut call: F,
) -> Result<T, WorkflowError>
where
    A: ?Sized,
    F: FnMut(Arc<A>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut tried = 0;
    let mut last_error = String::from("no agents configured");
    for (index, agent) in agents.iter().enumerate() {
        for attempt in 1..=attempts {
            tried += 1;
            match call(agent.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(stage, agent = index, attempt, error = %e, "agent call failed");
                    last_error = format!("{e:#}");
                }
            }
        }
    }
    Err(WorkflowError::AgentExhausted {
        stage,
        attempts: tried,
        message: last_error,
    })
}

pub struct PlannerChain {
    agents: Vec<Arc<dyn Planner>>,
    attempts: u32,
}

impl PlannerChain {
    pub fn new(agents: Vec<Arc<dyn Planner>>, attempts: u32) -> Self {
        Self { agents, attempts }
    }

    pub async fn plan(&self, request: &PlanRequest) -> Result<Plan, WorkflowError> {
        run_chain("generator", &self.agents, self.attempts, |agent| async move {
            agent.plan(request).await
        })
        .await
    }
}

pub struct DigesterChain {
    agents: Vec<Arc<dyn Digester>>,
    attempts: u32,
}

impl DigesterChain {
    pub fn new(agents: Vec<Arc<dyn Digester>>, attempts: u32) -> Self {
        Self { agents, attempts }
    }

    pub async fn digest(&self, request: &DigestRequest) -> Result<Digest, WorkflowError> {
        run_chain("processor", &self.agents, self.attempts, |agent| async move {
            agent.digest(request).await
        })
        .await
    }
}

/// Agent backed by an external command.
///
/// The request is written to stdin as one JSON object with a `mode` field
/// (`"plan"` or `"digest"`); the first JSON object on stdout is the answer.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[instrument(skip_all, fields(command = %self.command, mode = %mode))]
    async fn invoke<Req: Serialize, Resp: DeserializeOwned>(&self, mode: &str, request: &Req) -> Result<Resp> {
        let mut body = serde_json::to_value(request).context("Failed to serialize agent request")?;
        let Value::Object(fields) = &mut body else {
            bail!("agent request must serialize to a JSON object");
        };
        fields.insert("mode".into(), Value::String(mode.to_string()));

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn agent command: {}", self.command))?;

        // The request write must stay under the timeout below, so it runs in
        // its own task. Dropping stdin closes the pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let payload = body.to_string().into_bytes();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "agent stopped reading its request");
                }
            })
        });

        let waited = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        if let Some(writer) = writer {
            writer.abort();
        }
        let output = waited
            .map_err(|_| anyhow!("agent command timed out after {:?}", self.timeout))?
            .context("Failed to wait for agent command")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "agent command exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        debug!(bytes = output.stdout.len(), "agent responded");

        let json = extract_json_object(&stdout)
            .ok_or_else(|| anyhow!("agent output contained no JSON object"))?;
        serde_json::from_str(json).with_context(|| format!("Failed to parse agent response: {json}"))
    }
}

#[async_trait]
impl Planner for CommandAgent {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan> {
        self.invoke("plan", request).await
    }
}

#[async_trait]
impl Digester for CommandAgent {
    async fn digest(&self, request: &DigestRequest) -> Result<Digest> {
        self.invoke("digest", request).await
    }
}

/// First balanced `{...}` in `text`, ignoring braces inside JSON strings.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
