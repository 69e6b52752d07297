//! Session inspection commands: `stagehand session`, `events`, `artifacts`.

use anyhow::Result;
use stagehand_common::{SessionRecord, StateMap};

use super::super::{Cli, SessionCommands};
use super::{Workspace, print_json};

fn print_session(record: &SessionRecord) {
    println!("Session {}", record.key);
    println!("  version      {}", record.version);
    println!("  last update  {}", record.last_update_time.to_rfc3339());
    if record.state.is_empty() {
        println!("  state        (empty)");
        return;
    }
    println!("  state");
    for (key, value) in &record.state {
        println!("    {} = {}", key, value);
    }
}

pub async fn cmd_session(workspace: &Workspace, cli: &Cli, command: SessionCommands) -> Result<()> {
    match command {
        SessionCommands::Create { session, state } => {
            let key = workspace.session_key(cli, &session);
            let initial: StateMap = state.into_iter().collect();
            let record = workspace.sessions.create(&key, initial).await?;
            println!("Created session {} (version {})", record.key, record.version);
        }
        SessionCommands::Show { session, json } => {
            let record = workspace
                .sessions
                .get(&workspace.session_key(cli, &session))
                .await?;
            if json {
                print_json(&record)?;
            } else {
                print_session(&record);
            }
        }
        SessionCommands::List { json } => {
            let sessions = workspace.sessions.list(&cli.app, &cli.user).await?;
            if json {
                return print_json(&sessions);
            }
            if sessions.is_empty() {
                println!("No sessions for {}/{}", cli.app, cli.user);
                return Ok(());
            }
            for record in &sessions {
                println!(
                    "{:<24} v{:<4} {}",
                    record.key.session,
                    record.version,
                    record.last_update_time.to_rfc3339()
                );
            }
        }
        SessionCommands::Delete { session } => {
            let key = workspace.session_key(cli, &session);
            workspace.sessions.delete(&key).await?;
            println!("Deleted session {}", key);
        }
    }
    Ok(())
}

pub async fn cmd_events(workspace: &Workspace, cli: &Cli, session: &str, json: bool) -> Result<()> {
    let events = workspace
        .sessions
        .events(&workspace.session_key(cli, session))
        .await?;
    if json {
        return print_json(&events);
    }
    if events.is_empty() {
        println!("No events recorded for {}", session);
        return Ok(());
    }
    for event in &events {
        let keys: Vec<&str> = event.state_delta.keys().map(String::as_str).collect();
        println!(
            "#{:<4} {:<10} {}  [{}]",
            event.sequence,
            event.author,
            event.event_id,
            keys.join(", ")
        );
    }
    Ok(())
}

pub async fn cmd_artifacts(workspace: &Workspace, cli: &Cli, session: &str, json: bool) -> Result<()> {
    let key = workspace.session_key(cli, session);
    let artifacts = workspace.artifacts.list_for_session(&key.to_string()).await?;
    if json {
        return print_json(&artifacts);
    }
    if artifacts.is_empty() {
        println!("No artifacts for {}", session);
        return Ok(());
    }
    for artifact in &artifacts {
        println!(
            "iter {:<3} {:<10} {}  {}",
            artifact.iteration, artifact.status, artifact.artifact_id, artifact.instruction
        );
        if let Some(error) = &artifact.error {
            println!("         error: {}", error);
        }
    }
    Ok(())
}
