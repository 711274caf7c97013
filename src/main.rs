use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ideaforge::queue::Priority;

mod cmd;

#[derive(Parser)]
#[command(name = "ideaforge")]
#[command(version, about = "Turns ideas into running web apps through a coding agent")]
pub struct Cli {
    /// Project directory holding .ideaforge/ (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator and its HTTP/WebSocket API
    Serve {
        /// Port to serve on (overrides config and IDEAFORGE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Submit an idea to a running server
    Submit {
        /// Stable key grouping all revisions of one application
        identity: String,
        /// The idea text
        text: String,
        #[arg(short = 'P', long, default_value = "medium")]
        priority: Priority,
        /// Explicit revision number
        #[arg(long)]
        revision: Option<u32>,
        /// Server base URL (defaults to the configured host and port)
        #[arg(long)]
        server: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default ideaforge.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match cli.command {
        Commands::Serve { port } => cmd::cmd_serve(&project_dir, port, cli.log_json).await?,
        Commands::Submit {
            identity,
            text,
            priority,
            revision,
            server,
        } => {
            ideaforge::logging::init(cli.log_json, None)?;
            cmd::cmd_submit(
                &project_dir,
                server.as_deref(),
                cmd::SubmitArgs {
                    identity,
                    text,
                    priority,
                    revision,
                },
            )
            .await?;
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command)?,
    }

    Ok(())
}
