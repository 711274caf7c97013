//! Configuration view and validation commands: `ideaforge config`.

use anyhow::{Context, Result};

use ideaforge::config::{CONFIG_DIR, CONFIG_FILE, ENV_AGENT_CMD, ENV_APPS_DIR, ENV_MAX_SESSIONS, ENV_PORT, ForgeConfig, ForgeToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No ideaforge.toml found at {} (using defaults)", config_path.display());
            }

            let config = ForgeConfig::new(project_dir.to_path_buf())?;
            let overrides: Vec<&str> = [ENV_AGENT_CMD, ENV_APPS_DIR, ENV_MAX_SESSIONS, ENV_PORT]
                .into_iter()
                .filter(|k| std::env::var(k).is_ok())
                .collect();
            if !overrides.is_empty() {
                println!("Environment overrides: {}", overrides.join(", "));
            }
            println!("Apps directory: {}", config.apps_dir().display());
            println!();
            println!("Effective configuration:");
            println!();
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = ForgeConfig::new(project_dir.to_path_buf())?;
            let warnings = config.validate();
            if warnings.is_empty() {
                if config_path.exists() {
                    println!("Configuration is valid.");
                } else {
                    println!("No ideaforge.toml found. Using defaults (valid).");
                }
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("ideaforge.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            ForgeToml::default().save(&config_path)?;

            println!("Created ideaforge.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [pool] agent_cmd, max_sessions, single_session");
            println!("  - [agent] approval mode and safelist");
            println!("  - [apps] dir and port range");
            println!("  - [fleet] iteration pacing and auto start");
            println!();
        }
    }

    Ok(())
}
