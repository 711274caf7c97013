//! Orchestrator server command: `ideaforge serve`.

use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use ideaforge::config::ForgeConfig;
use ideaforge::logging;
use ideaforge::orchestrator::Orchestrator;
use ideaforge::server::{shutdown_signal, start_server};

pub async fn cmd_serve(project_dir: &Path, port: Option<u16>, log_json: bool) -> Result<()> {
    let config = ForgeConfig::with_cli_args(project_dir.to_path_buf(), port, log_json)?;
    let log_dir = config.toml.logging.file.then(|| config.log_dir());
    let _guard = logging::init(config.log_json(), log_dir.as_deref())?;

    for warning in config.validate() {
        warn!("config: {}", warning);
    }
    info!(
        project_dir = %config.project_dir.display(),
        apps_dir = %config.apps_dir().display(),
        "starting ideaforge"
    );

    let orchestrator = Orchestrator::from_config(&config)?;
    let served = start_server(config.server_config(), orchestrator.clone(), shutdown_signal()).await;

    // Stop apps and agents even when the server failed to bind
    orchestrator.shutdown().await;
    served
}
