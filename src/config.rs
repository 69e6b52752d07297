//! Configuration read from `.stagehand/stagehand.toml`.
//!
//! Every field has a default, so a missing file is a valid configuration.
//! Values are layered file → environment → CLI, later layers winning.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! path = ".stagehand/state.db"
//! blob_dir = ".stagehand/blobs"
//! occ_max_attempts = 5
//! occ_backoff_ms = 10
//!
//! [pipeline]
//! max_iterations = 5
//! preview_chars = 2000
//! agent_attempts = 2
//!
//! [backend]
//! kind = "process"
//! interpreter = "python3"
//! interpreter_args = ["-u"]
//! timeout_secs = 300
//! work_dir = ".stagehand/runs"
//!
//! [agent]
//! command = "my-agent"
//! args = ["--json"]
//! timeout_secs = 300
//!
//! [[agent.fallback]]
//! command = "backup-agent"
//!
//! [logging]
//! format = "compact"
//! file = ".stagehand/logs/stagehand.log"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::preview::DEFAULT_PREVIEW_CHARS;
use crate::session::SessionStoreConfig;

pub const ENV_DB: &str = "STAGEHAND_DB";
pub const ENV_MAX_ITERATIONS: &str = "STAGEHAND_MAX_ITERATIONS";
pub const ENV_AGENT_CMD: &str = "STAGEHAND_AGENT_CMD";

const CONFIG_DIR: &str = ".stagehand";
const CONFIG_FILE: &str = "stagehand.toml";

fn default_occ_max_attempts() -> u32 {
    5
}

fn default_occ_backoff_ms() -> u64 {
    10
}

fn default_max_iterations() -> u32 {
    5
}

fn default_preview_chars() -> usize {
    DEFAULT_PREVIEW_CHARS
}

fn default_agent_attempts() -> u32 {
    2
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// SQLite database (default: `.stagehand/state.db`)
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Blob directory (default: `.stagehand/blobs`)
    #[serde(default)]
    pub blob_dir: Option<PathBuf>,
    #[serde(default = "default_occ_max_attempts")]
    pub occ_max_attempts: u32,
    #[serde(default = "default_occ_backoff_ms")]
    pub occ_backoff_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: None,
            blob_dir: None,
            occ_max_attempts: default_occ_max_attempts(),
            occ_backoff_ms: default_occ_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Bound on inline previews and stored instructions, in characters
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    /// Attempts per agent before falling back to the next one
    #[serde(default = "default_agent_attempts")]
    pub agent_attempts: u32,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            preview_chars: default_preview_chars(),
            agent_attempts: default_agent_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Run work units locally under `interpreter`
    #[default]
    Process,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Process => write!(f, "process"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Per-run scratch directories (default: `.stagehand/runs`)
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            interpreter: default_interpreter(),
            interpreter_args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Tried in order after the primary command is exhausted
    #[serde(default)]
    pub fallback: Vec<AgentCommand>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            fallback: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: compact, json", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Also write logs to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// The complete stagehand.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagehandToml {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl StagehandToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stagehand.toml")
    }

    /// Load `<dir>/stagehand.toml`, or defaults if it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize stagehand.toml")
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.pipeline.max_iterations == 0 {
            warnings.push("pipeline.max_iterations is 0; runs will do nothing".to_string());
        }
        if self.pipeline.preview_chars == 0 {
            warnings.push("pipeline.preview_chars is 0; previews will be empty".to_string());
        }
        if self.store.occ_max_attempts == 0 {
            warnings.push("store.occ_max_attempts is 0; treated as 1".to_string());
        }
        if self.backend.timeout_secs == 0 {
            warnings.push("backend.timeout_secs is 0; every run will time out".to_string());
        }
        if self.agent.command.is_none() {
            warnings.push(format!(
                "agent.command is not set; `run` needs it or {}",
                ENV_AGENT_CMD
            ));
        }
        warnings
    }
}

/// Pick the CLI value, else a parseable environment value, else the file value.
fn layered<T: FromStr>(cli: Option<T>, env_name: &str, env: Option<String>, file: T) -> T {
    if let Some(value) = cli {
        return value;
    }
    if let Some(raw) = env {
        match raw.parse() {
            Ok(value) => return value,
            Err(_) => warn!(var = env_name, value = %raw, "ignoring unparseable environment override"),
        }
    }
    file
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct StagehandConfig {
    pub project_dir: PathBuf,
    pub stagehand_dir: PathBuf,
    pub toml: StagehandToml,
    cli_max_iterations: Option<u32>,
}

impl StagehandConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let stagehand_dir = project_dir.join(CONFIG_DIR);
        let toml = StagehandToml::load_or_default(&stagehand_dir)?;
        Ok(Self {
            project_dir,
            stagehand_dir,
            toml,
            cli_max_iterations: None,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, max_iterations: Option<u32>) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_max_iterations = max_iterations;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.stagehand_dir.join(CONFIG_FILE)
    }

    /// Expand `~/` and anchor relative paths at the project directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if let Ok(rest) = path.strip_prefix("~")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    /// Database path (env → file → default).
    pub fn db_path(&self) -> PathBuf {
        env_var(ENV_DB)
            .map(PathBuf::from)
            .or_else(|| self.toml.store.path.clone())
            .map(|p| self.resolve_path(&p))
            .unwrap_or_else(|| self.stagehand_dir.join("state.db"))
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.toml
            .store
            .blob_dir
            .as_deref()
            .map(|p| self.resolve_path(p))
            .unwrap_or_else(|| self.stagehand_dir.join("blobs"))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.toml
            .backend
            .work_dir
            .as_deref()
            .map(|p| self.resolve_path(p))
            .unwrap_or_else(|| self.stagehand_dir.join("runs"))
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.toml.logging.file.as_deref().map(|p| self.resolve_path(p))
    }

    /// Iteration cap (CLI → env → file).
    pub fn max_iterations(&self) -> u32 {
        layered(
            self.cli_max_iterations,
            ENV_MAX_ITERATIONS,
            env_var(ENV_MAX_ITERATIONS),
            self.toml.pipeline.max_iterations,
        )
    }

    /// Agent commands in fallback order; the primary comes from env or file.
    pub fn agent_commands(&self) -> Vec<AgentCommand> {
        let primary = env_var(ENV_AGENT_CMD)
            .map(|command| AgentCommand {
                command,
                args: Vec::new(),
            })
            .or_else(|| {
                self.toml.agent.command.clone().map(|command| AgentCommand {
                    command,
                    args: self.toml.agent.args.clone(),
                })
            });
        primary
            .into_iter()
            .chain(self.toml.agent.fallback.iter().cloned())
            .collect()
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.agent.timeout_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.backend.timeout_secs)
    }

    pub fn session_store_config(&self) -> SessionStoreConfig {
        SessionStoreConfig {
            max_attempts: self.toml.store.occ_max_attempts.max(1),
            backoff: Duration::from_millis(self.toml.store.occ_backoff_ms),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
