use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version, about = "Stage-gated agent pipeline over a durable session store")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Application namespace for sessions
    #[arg(long, global = true, default_value = "stagehand")]
    pub app: String,

    /// User that owns the sessions
    #[arg(long, global = true, default_value = "local")]
    pub user: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, inspect or delete sessions
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// List the events recorded for a session
    Events {
        session: String,
        #[arg(long)]
        json: bool,
    },
    /// List the artifacts generated in a session
    Artifacts {
        session: String,
        #[arg(long)]
        json: bool,
    },
    /// Run the pipeline against a session
    Run {
        #[arg(short, long)]
        session: String,

        /// Override the configured iteration cap
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Create the session first if it does not exist
        #[arg(long)]
        create: bool,

        /// Print the run outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SessionCommands {
    Create {
        session: String,
        /// Initial state entry as KEY=VALUE; VALUE is parsed as JSON, else taken as a string
        #[arg(long = "state", value_parser = cmd::parse_state_entry)]
        state: Vec<(String, serde_json::Value)>,
    },
    Show {
        session: String,
        #[arg(long)]
        json: bool,
    },
    List {
        #[arg(long)]
        json: bool,
    },
    Delete {
        session: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default stagehand.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Config { command } = &cli.command {
        cmd::cmd_config(&project_dir, command.clone())?;
        return Ok(ExitCode::SUCCESS);
    }

    let max_iterations = match &cli.command {
        Commands::Run { max_iterations, .. } => *max_iterations,
        _ => None,
    };
    let config = stagehand::config::StagehandConfig::with_cli_args(project_dir, max_iterations)?;
    let _log_guard = stagehand::logging::init(
        config.toml.logging.format,
        config.log_file().as_deref(),
        cli.verbose,
    )?;
    let workspace = cmd::Workspace::open(config)?;

    match &cli.command {
        Commands::Session { command } => cmd::cmd_session(&workspace, &cli, command.clone()).await?,
        Commands::Events { session, json } => {
            cmd::cmd_events(&workspace, &cli, session, *json).await?
        }
        Commands::Artifacts { session, json } => {
            cmd::cmd_artifacts(&workspace, &cli, session, *json).await?
        }
        Commands::Run {
            session,
            create,
            json,
            ..
        } => {
            let outcome = cmd::cmd_run(&workspace, &cli, session, *create, *json).await?;
            if outcome.termination.is_fatal() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Config { .. } => {}
    }

    Ok(ExitCode::SUCCESS)
}
