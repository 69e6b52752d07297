//! CLI command implementations.
//!
//! | Module    | Commands handled                      |
//! |-----------|---------------------------------------|
//! | `session` | `Session`, `Events`, `Artifacts`      |
//! | `run`     | `Run`                                 |
//! | `config`  | `Config`                              |

pub mod config;
pub mod run;
pub mod session;

pub use config::cmd_config;
pub use run::cmd_run;
pub use session::{cmd_artifacts, cmd_events, cmd_session};

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use stagehand::artifacts::ArtifactRegistry;
use stagehand::config::StagehandConfig;
use stagehand::session::SessionStore;
use stagehand::store::{SqliteStore, StateStore};
use stagehand_common::SessionKey;

use super::Cli;

/// Stores opened for one CLI invocation.
pub struct Workspace {
    pub config: StagehandConfig,
    pub sessions: SessionStore,
    pub artifacts: ArtifactRegistry,
}

impl Workspace {
    pub fn open(config: StagehandConfig) -> Result<Self> {
        let db_path = config.db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let store: Arc<dyn StateStore> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {}", db_path.display()))?,
        );
        let sessions = SessionStore::with_config(store.clone(), config.session_store_config());
        let artifacts = ArtifactRegistry::new(store)
            .with_instruction_chars(config.toml.pipeline.preview_chars);
        Ok(Self {
            config,
            sessions,
            artifacts,
        })
    }

    pub fn session_key(&self, cli: &Cli, session: &str) -> SessionKey {
        SessionKey::new(&cli.app, &cli.user, session)
    }
}

/// Parse `KEY=VALUE`, reading VALUE as JSON and falling back to a string.
pub fn parse_state_entry(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        anyhow::bail!("state key must not be empty");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}
