//! Configuration view and validation: `stagehand config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use stagehand::config::{StagehandConfig, StagehandToml};

    let config = StagehandConfig::new(project_dir.to_path_buf())?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No stagehand.toml found at {} (using defaults)", config_path.display());
            }
            println!();
            print!("{}", config.toml.to_toml_string()?);
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!("  database = {}", config.db_path().display());
            println!("  blob_dir = {}", config.blob_dir().display());
            println!("  work_dir = {}", config.work_dir().display());
            println!("  max_iterations = {}", config.max_iterations());
            let agents: Vec<String> = config
                .agent_commands()
                .into_iter()
                .map(|a| a.command)
                .collect();
            if agents.is_empty() {
                println!("  agents = (none)");
            } else {
                println!("  agents = {}", agents.join(" -> "));
            }
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("stagehand.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            std::fs::create_dir_all(&config.stagehand_dir)?;
            std::fs::write(&config_path, StagehandToml::default().to_toml_string()?)?;
            println!("Created stagehand.toml at {}", config_path.display());
        }
    }

    Ok(())
}
