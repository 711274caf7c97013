//! Layered configuration for ideaforge.
//!
//! Settings are read from `.ideaforge/ideaforge.toml` under the project
//! directory, then overridden by environment variables, then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [queue]
//! max_size = 100
//! max_attempts = 3
//! max_concurrent_tasks = 5
//!
//! [pool]
//! max_sessions = 10
//! base_port = 8090
//! agent_cmd = "iflow"
//! agent_args = ["--experimental-acp", "--port", "{port}"]
//!
//! [agent]
//! approval = "selective"
//! safelist = ["edit"]
//!
//! [apps]
//! dir = "generated-apps"
//! port_start = 3001
//! port_end = 3999
//!
//! [fleet]
//! max_concurrent = 5
//! auto_start_on_create = false
//!
//! [server]
//! host = "127.0.0.1"
//! port = 3000
//! ```
//!
//! | Variable                 | Overrides            |
//! |--------------------------|----------------------|
//! | `IDEAFORGE_AGENT_CMD`    | `pool.agent_cmd`     |
//! | `IDEAFORGE_APPS_DIR`     | `apps.dir`           |
//! | `IDEAFORGE_MAX_SESSIONS` | `pool.max_sessions`  |
//! | `IDEAFORGE_PORT`         | `server.port`        |

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::apps::RunnerConfig;
use crate::deploy::PipelineConfig;
use crate::fleet::FleetConfig;
use crate::queue::QueueConfig;
use crate::rpc::{ApprovalMode, ApprovalPolicy, TurnTimeouts};
use crate::server::ServerConfig;
use crate::session::{PoolConfig, SingleSessionConfig, SpawnConfig};

pub const CONFIG_DIR: &str = ".ideaforge";
pub const CONFIG_FILE: &str = "ideaforge.toml";

pub const ENV_AGENT_CMD: &str = "IDEAFORGE_AGENT_CMD";
pub const ENV_APPS_DIR: &str = "IDEAFORGE_APPS_DIR";
pub const ENV_MAX_SESSIONS: &str = "IDEAFORGE_MAX_SESSIONS";
pub const ENV_PORT: &str = "IDEAFORGE_PORT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_size: usize,
    pub max_attempts: u32,
    pub max_concurrent_tasks: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_attempts: 3,
            max_concurrent_tasks: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_sessions: usize,
    pub base_port: u16,
    pub port_range: u16,
    pub agent_cmd: String,
    /// `{port}` is replaced with the session port.
    pub agent_args: Vec<String>,
    pub ready_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub acquire_timeout_secs: u64,
    /// Use one shared agent connection instead of the pool.
    pub single_session: bool,
    pub single_idle_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        let spawn = SpawnConfig::default();
        Self {
            max_sessions: 10,
            base_port: 8090,
            port_range: 50,
            agent_cmd: spawn.program,
            agent_args: spawn.args,
            ready_timeout_secs: 60,
            idle_timeout_secs: 3600,
            reap_interval_secs: 3600,
            acquire_timeout_secs: 60,
            single_session: false,
            single_idle_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub approval: ApprovalMode,
    /// Tool kinds approved automatically in `selective` mode.
    pub safelist: Vec<String>,
    pub connect_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub first_idle_timeout_secs: u64,
    pub overall_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            approval: ApprovalMode::default(),
            safelist: vec!["edit".to_string()],
            connect_timeout_secs: 30,
            send_timeout_secs: 120,
            idle_timeout_secs: 30,
            first_idle_timeout_secs: 300,
            overall_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppsSection {
    /// Relative paths resolve against the project directory.
    pub dir: PathBuf,
    pub port_start: u16,
    pub port_end: u16,
    pub run_cmd: String,
    pub run_args: Vec<String>,
    pub stop_timeout_secs: u64,
}

impl Default for AppsSection {
    fn default() -> Self {
        let runner = RunnerConfig::default();
        Self {
            dir: PathBuf::from("generated-apps"),
            port_start: runner.port_start,
            port_end: runner.port_end,
            run_cmd: runner.program,
            run_args: runner.args,
            stop_timeout_secs: runner.stop_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSection {
    pub max_concurrent: usize,
    pub rest_interval_secs: u64,
    pub first_delay_secs: u64,
    pub zombie_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub circuit_threshold: u32,
    pub auto_start_on_create: bool,
    pub auto_start_delay_secs: u64,
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            rest_interval_secs: 30,
            first_delay_secs: 2,
            zombie_timeout_secs: 600,
            sweep_interval_secs: 60,
            circuit_threshold: 5,
            auto_start_on_create: false,
            auto_start_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Allow cross-origin requests from any origin.
    pub cors: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            cors: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub json: bool,
    /// Also write daily-rolling log files under `.ideaforge/logs`.
    pub file: bool,
}

/// The complete ideaforge.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeToml {
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub apps: AppsSection,
    #[serde(default)]
    pub fleet: FleetSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ForgeToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse ideaforge.toml")
    }

    /// Load from `<config_dir>/ideaforge.toml`, or defaults if it is missing.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize ideaforge.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `IDEAFORGE_*` environment overrides. Unparsable values are
    /// returned as warnings and ignored.
    pub fn apply_env(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Ok(cmd) = std::env::var(ENV_AGENT_CMD)
            && !cmd.trim().is_empty()
        {
            self.pool.agent_cmd = cmd;
        }
        if let Ok(dir) = std::env::var(ENV_APPS_DIR)
            && !dir.trim().is_empty()
        {
            self.apps.dir = PathBuf::from(dir);
        }
        if let Ok(raw) = std::env::var(ENV_MAX_SESSIONS) {
            match raw.parse() {
                Ok(n) => self.pool.max_sessions = n,
                Err(_) => warnings.push(format!("Ignoring {}='{}': not a number", ENV_MAX_SESSIONS, raw)),
            }
        }
        if let Ok(raw) = std::env::var(ENV_PORT) {
            match raw.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warnings.push(format!("Ignoring {}='{}': not a port", ENV_PORT, raw)),
            }
        }
        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.queue.max_size == 0 {
            warnings.push("queue.max_size is 0: every submission will be rejected".to_string());
        }
        if self.queue.max_attempts == 0 {
            warnings.push("queue.max_attempts is 0: treated as a single attempt".to_string());
        }
        if self.queue.max_concurrent_tasks == 0 {
            warnings.push("queue.max_concurrent_tasks is 0: no task will ever run".to_string());
        }
        if self.pool.max_sessions == 0 && !self.pool.single_session {
            warnings.push("pool.max_sessions is 0: no agent session can be acquired".to_string());
        }
        if self.pool.port_range == 0 {
            warnings.push("pool.port_range is 0: no agent port is available".to_string());
        } else if usize::from(self.pool.port_range) < self.pool.max_sessions {
            warnings.push(format!(
                "pool.port_range ({}) is smaller than pool.max_sessions ({})",
                self.pool.port_range, self.pool.max_sessions
            ));
        }
        if self.pool.agent_cmd.trim().is_empty() {
            warnings.push("pool.agent_cmd is empty".to_string());
        }
        if self.apps.port_start > self.apps.port_end {
            warnings.push(format!(
                "apps.port_start ({}) is greater than apps.port_end ({})",
                self.apps.port_start, self.apps.port_end
            ));
        }
        let pool_end = u32::from(self.pool.base_port) + u32::from(self.pool.port_range);
        if u32::from(self.apps.port_start) < pool_end && u32::from(self.apps.port_end) >= u32::from(self.pool.base_port) {
            warnings.push("apps port range overlaps the agent pool port range".to_string());
        }
        if self.agent.approval == ApprovalMode::Selective && self.agent.safelist.is_empty() {
            warnings.push("agent.safelist is empty: selective mode will reject every tool call".to_string());
        }
        if self.agent.overall_timeout_secs == 0 {
            warnings.push("agent.overall_timeout_secs is 0: every turn will time out".to_string());
        }
        if self.fleet.max_concurrent == 0 {
            warnings.push("fleet.max_concurrent is 0: no iteration loop can start".to_string());
        }
        if self.fleet.circuit_threshold == 0 {
            warnings.push("fleet.circuit_threshold is 0: loops pause before their first turn finishes".to_string());
        }

        warnings
    }
}

/// Unified configuration: file, then environment, then CLI.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    pub project_dir: PathBuf,
    /// The `.ideaforge` directory; also the data directory.
    pub config_dir: PathBuf,
    pub toml: ForgeToml,
    /// Warnings raised while applying environment overrides.
    pub env_warnings: Vec<String>,
    pub cli_port: Option<u16>,
    pub cli_log_json: bool,
}

impl ForgeConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = ForgeToml::load_or_default(&config_dir)?;
        let env_warnings = toml.apply_env();

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            env_warnings,
            cli_port: None,
            cli_log_json: false,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, port: Option<u16>, log_json: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_port = port;
        config.cli_log_json = log_json;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn data_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn log_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    pub fn apps_dir(&self) -> PathBuf {
        if self.toml.apps.dir.is_absolute() {
            self.toml.apps.dir.clone()
        } else {
            self.project_dir.join(&self.toml.apps.dir)
        }
    }

    /// Server port (CLI → env → file).
    pub fn server_port(&self) -> u16 {
        self.cli_port.unwrap_or(self.toml.server.port)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.toml.server.host.clone(),
            port: self.server_port(),
            cors: self.toml.server.cors,
        }
    }

    pub fn log_json(&self) -> bool {
        self.cli_log_json || self.toml.logging.json
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.env_warnings.clone();
        warnings.extend(self.toml.validate());
        warnings
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_size: self.toml.queue.max_size,
            max_attempts: self.toml.queue.max_attempts.max(1),
        }
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.toml.queue.max_concurrent_tasks.max(1)
    }

    pub fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            program: self.toml.pool.agent_cmd.clone(),
            args: self.toml.pool.agent_args.clone(),
            ready_timeout: Duration::from_secs(self.toml.pool.ready_timeout_secs),
            ..SpawnConfig::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        let pool = &self.toml.pool;
        PoolConfig {
            max_sessions: pool.max_sessions,
            base_port: pool.base_port,
            port_range: pool.port_range,
            idle_timeout: Duration::from_secs(pool.idle_timeout_secs),
            reap_interval: Duration::from_secs(pool.reap_interval_secs),
        }
    }

    pub fn single_session_config(&self) -> SingleSessionConfig {
        SingleSessionConfig {
            base_port: self.toml.pool.base_port,
            port_range: self.toml.pool.port_range,
            idle_window: Duration::from_secs(self.toml.pool.single_idle_secs),
        }
    }

    pub fn turn_timeouts(&self) -> TurnTimeouts {
        let agent = &self.toml.agent;
        TurnTimeouts {
            connect: Duration::from_secs(agent.connect_timeout_secs),
            send: Duration::from_secs(agent.send_timeout_secs),
            idle: Duration::from_secs(agent.idle_timeout_secs),
            first_idle: Duration::from_secs(agent.first_idle_timeout_secs),
            overall: Duration::from_secs(agent.overall_timeout_secs),
        }
    }

    pub fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::new(self.toml.agent.approval, self.toml.agent.safelist.iter().cloned())
    }

    pub fn runner_config(&self) -> RunnerConfig {
        let apps = &self.toml.apps;
        RunnerConfig {
            program: apps.run_cmd.clone(),
            args: apps.run_args.clone(),
            port_start: apps.port_start,
            port_end: apps.port_end,
            stop_timeout: Duration::from_secs(apps.stop_timeout_secs),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            apps_dir: self.apps_dir(),
            acquire_timeout: Duration::from_secs(self.toml.pool.acquire_timeout_secs),
        }
    }

    pub fn fleet_config(&self) -> FleetConfig {
        let fleet = &self.toml.fleet;
        FleetConfig {
            max_concurrent: fleet.max_concurrent,
            rest_interval: Duration::from_secs(fleet.rest_interval_secs),
            first_delay: Duration::from_secs(fleet.first_delay_secs),
            zombie_timeout: Duration::from_secs(fleet.zombie_timeout_secs),
            sweep_interval: Duration::from_secs(fleet.sweep_interval_secs.max(1)),
            circuit_threshold: fleet.circuit_threshold,
            auto_start_on_create: fleet.auto_start_on_create,
            auto_start_delay: Duration::from_secs(fleet.auto_start_delay_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Clears every override variable for the guard's lifetime.
    struct EnvGuard {
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn clear() -> Self {
            let saved = [ENV_AGENT_CMD, ENV_APPS_DIR, ENV_MAX_SESSIONS, ENV_PORT]
                .into_iter()
                .map(|k| (k, std::env::var(k).ok()))
                .collect();
            for k in [ENV_AGENT_CMD, ENV_APPS_DIR, ENV_MAX_SESSIONS, ENV_PORT] {
                unsafe { std::env::remove_var(k) };
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in &self.saved {
                match v {
                    Some(v) => unsafe { std::env::set_var(k, v) },
                    None => unsafe { std::env::remove_var(k) },
                }
            }
        }
    }

    #[test]
    fn test_parse_empty_gives_defaults() {
        let toml = ForgeToml::parse("").unwrap();
        assert_eq!(toml.queue.max_size, 100);
        assert_eq!(toml.queue.max_attempts, 3);
        assert_eq!(toml.pool.max_sessions, 10);
        assert_eq!(toml.pool.base_port, 8090);
        assert_eq!(toml.pool.agent_cmd, "iflow");
        assert_eq!(toml.agent.approval, ApprovalMode::Selective);
        assert_eq!(toml.apps.dir, PathBuf::from("generated-apps"));
        assert_eq!(toml.fleet.circuit_threshold, 5);
        assert_eq!(toml.server.port, 3000);
        assert!(!toml.logging.json);
    }

    #[test]
    fn test_parse_partial_sections() {
        let content = r#"
[pool]
max_sessions = 3
single_session = true

[agent]
approval = "manual"

[fleet]
auto_start_on_create = true
"#;
        let toml = ForgeToml::parse(content).unwrap();
        assert_eq!(toml.pool.max_sessions, 3);
        assert!(toml.pool.single_session);
        assert_eq!(toml.pool.base_port, 8090);
        assert_eq!(toml.agent.approval, ApprovalMode::Manual);
        assert_eq!(toml.agent.safelist, vec!["edit".to_string()]);
        assert!(toml.fleet.auto_start_on_create);
        assert_eq!(toml.fleet.max_concurrent, 5);
    }

    #[test]
    fn test_parse_invalid_approval_mode() {
        let err = ForgeToml::parse("[agent]\napproval = \"yolo\"").unwrap_err();
        assert!(err.to_string().contains("Failed to parse ideaforge.toml"));
    }

    #[test]
    fn test_validate_defaults_clean() {
        assert!(ForgeToml::default().validate().is_empty());
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut toml = ForgeToml::default();
        toml.queue.max_size = 0;
        toml.apps.port_start = 5000;
        toml.apps.port_end = 4000;
        toml.agent.safelist.clear();
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("queue.max_size")));
        assert!(warnings.iter().any(|w| w.contains("apps.port_start")));
        assert!(warnings.iter().any(|w| w.contains("agent.safelist")));
    }

    #[test]
    fn test_validate_port_overlap() {
        let mut toml = ForgeToml::default();
        toml.apps.port_start = 8100;
        toml.apps.port_end = 8200;
        assert!(toml.validate().iter().any(|w| w.contains("overlaps")));
    }

    #[test]
    fn test_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _env = EnvGuard::clear();

        let mut toml = ForgeToml::parse("[pool]\nagent_cmd = \"from-file\"\n[server]\nport = 4000").unwrap();
        assert!(toml.apply_env().is_empty());
        assert_eq!(toml.pool.agent_cmd, "from-file");

        unsafe {
            std::env::set_var(ENV_AGENT_CMD, "from-env");
            std::env::set_var(ENV_PORT, "4100");
            std::env::set_var(ENV_MAX_SESSIONS, "lots");
        }
        let warnings = toml.apply_env();
        assert_eq!(toml.pool.agent_cmd, "from-env");
        assert_eq!(toml.server.port, 4100);
        assert_eq!(toml.pool.max_sessions, 10);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains(ENV_MAX_SESSIONS));
    }

    #[test]
    fn test_forge_config_layers_and_paths() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _env = EnvGuard::clear();

        let dir = tempdir().unwrap();
        let mut toml = ForgeToml::default();
        toml.server.port = 4000;
        toml.apps.dir = PathBuf::from("apps");
        toml.save(&dir.path().join(CONFIG_DIR).join(CONFIG_FILE)).unwrap();

        let config = ForgeConfig::with_cli_args(dir.path().to_path_buf(), None, false).unwrap();
        assert_eq!(config.server_port(), 4000);
        assert!(config.apps_dir().ends_with("apps"));
        assert!(config.apps_dir().is_absolute());
        assert!(config.log_dir().ends_with(".ideaforge/logs"));

        let config = ForgeConfig::with_cli_args(dir.path().to_path_buf(), Some(5000), true).unwrap();
        assert_eq!(config.server_port(), 5000);
        assert!(config.log_json());
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _env = EnvGuard::clear();

        let dir = tempdir().unwrap();
        let config = ForgeConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.server_port(), 3000);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_component_configs_follow_file() {
        let toml = ForgeToml::parse(
            r#"
[agent]
idle_timeout_secs = 45
approval = "auto"

[pool]
agent_args = ["serve", "--port={port}"]

[fleet]
rest_interval_secs = 90
"#,
        )
        .unwrap();
        let config = ForgeConfig {
            project_dir: PathBuf::from("/srv/project"),
            config_dir: PathBuf::from("/srv/project/.ideaforge"),
            toml,
            env_warnings: Vec::new(),
            cli_port: None,
            cli_log_json: false,
        };
        assert_eq!(config.turn_timeouts().idle, Duration::from_secs(45));
        assert_eq!(config.approval_policy().mode, ApprovalMode::Auto);
        assert_eq!(config.spawn_config().args_for(8091), vec!["serve", "--port=8091"]);
        assert_eq!(config.fleet_config().rest_interval, Duration::from_secs(90));
        assert_eq!(config.pipeline_config().apps_dir, PathBuf::from("/srv/project/generated-apps"));
    }
}
