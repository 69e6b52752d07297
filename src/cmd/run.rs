//! Pipeline execution: `stagehand run`.

use std::sync::Arc;

use anyhow::{Result, bail};
use stagehand::agent::{CommandAgent, Digester, DigesterChain, Planner, PlannerChain};
use stagehand::backend::{ExecutionBackend, ProcessBackend};
use stagehand::blob::{BlobStore, FsBlobStore};
use stagehand::config::BackendKind;
use stagehand::engine::{
    EngineConfig, GeneratorStage, OrchestrationEngine, ProcessorStage, RunOutcome, SubmitterStage,
    Termination,
};
use stagehand_common::StateMap;

use super::super::Cli;
use super::{Workspace, print_json};

pub async fn cmd_run(
    workspace: &Workspace,
    cli: &Cli,
    session: &str,
    create: bool,
    json: bool,
) -> Result<RunOutcome> {
    let config = &workspace.config;
    let key = workspace.session_key(cli, session);

    if let Err(e) = workspace.sessions.get(&key).await {
        if !(create && e.is_not_found()) {
            return Err(e.into());
        }
        workspace.sessions.create(&key, StateMap::new()).await?;
    }

    let commands = config.agent_commands();
    if commands.is_empty() {
        bail!(
            "No agent command configured. Set [agent] command in {} or {}.",
            config.config_file().display(),
            stagehand::config::ENV_AGENT_CMD
        );
    }
    let agents: Vec<Arc<CommandAgent>> = commands
        .into_iter()
        .map(|c| {
            Arc::new(
                CommandAgent::new(c.command, &config.project_dir)
                    .with_args(c.args)
                    .with_timeout(config.agent_timeout()),
            )
        })
        .collect();
    let planners: Vec<Arc<dyn Planner>> = agents.iter().map(|a| a.clone() as Arc<dyn Planner>).collect();
    let digesters: Vec<Arc<dyn Digester>> = agents.iter().map(|a| a.clone() as Arc<dyn Digester>).collect();

    let pipeline = &config.toml.pipeline;
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.blob_dir()));
    let backend: Arc<dyn ExecutionBackend> = match config.toml.backend.kind {
        BackendKind::Process => Arc::new(
            ProcessBackend::new(blobs.clone(), &config.toml.backend.interpreter, config.work_dir())
                .with_args(config.toml.backend.interpreter_args.clone())
                .with_preview_chars(pipeline.preview_chars),
        ),
    };

    let engine = OrchestrationEngine::new(
        workspace.sessions.clone(),
        workspace.artifacts.clone(),
        GeneratorStage::new(
            PlannerChain::new(planners, pipeline.agent_attempts),
            workspace.artifacts.clone(),
            blobs.clone(),
        )
        .with_preview_chars(pipeline.preview_chars),
        SubmitterStage::new(backend, workspace.artifacts.clone(), config.backend_timeout()),
        ProcessorStage::new(DigesterChain::new(digesters, pipeline.agent_attempts), blobs),
        EngineConfig {
            max_iterations: config.max_iterations(),
        },
    );

    let outcome = engine.run(&key).await;

    if json {
        print_json(&outcome)?;
        return Ok(outcome);
    }

    println!(
        "Run {} on {} finished after {} iteration(s)",
        outcome.invocation_id, outcome.session, outcome.iterations
    );
    match &outcome.termination {
        Termination::Success => println!("  result: success"),
        Termination::ExitRequested { reason } => println!("  result: exit_requested ({})", reason),
        Termination::FatalError { message } => eprintln!("  result: fatal_error: {}", message),
    }
    if let Ok(record) = workspace.sessions.get(&key).await
        && let Some(summary) = record.get_str(stagehand::engine::keys::SUMMARY)
    {
        println!("  summary: {}", summary);
    }
    Ok(outcome)
}
