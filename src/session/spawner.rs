//! Launching external agent processes.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::PoolError;
use crate::ports;

/// A running agent process.
///
/// Cancelling `kill` terminates it; `exited` resolves once it is gone, for
/// whatever reason.
pub struct AgentProcess {
    pub port: u16,
    pub pid: Option<u32>,
    pub kill: CancellationToken,
    pub exited: oneshot::Receiver<()>,
}

#[async_trait]
pub trait AgentSpawner: Send + Sync {
    /// Launch an agent listening on `port` and wait until it is ready.
    async fn spawn(&self, port: u16) -> Result<AgentProcess, PoolError>;
}

#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub program: String,
    /// `{port}` is replaced with the assigned port.
    pub args: Vec<String>,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            program: "iflow".to_string(),
            args: vec![
                "--experimental-acp".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            ready_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(300),
        }
    }
}

impl SpawnConfig {
    pub fn args_for(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args.iter().map(|a| a.replace("{port}", &port)).collect()
    }
}

/// Spawns the agent as a child process.
pub struct CommandSpawner {
    config: SpawnConfig,
}

impl CommandSpawner {
    pub fn new(config: SpawnConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentSpawner for CommandSpawner {
    async fn spawn(&self, port: u16) -> Result<AgentProcess, PoolError> {
        let mut child = Command::new(&self.config.program)
            .args(self.config.args_for(port))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(PoolError::SpawnFailed)?;

        let pid = child.id();
        info!(port, pid, program = %self.config.program, "spawned agent process");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, port, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, port, "stderr"));
        }

        let started = tokio::time::Instant::now();
        loop {
            if let Some(status) = child.try_wait().map_err(PoolError::SpawnFailed)? {
                return Err(PoolError::SpawnFailed(std::io::Error::other(format!(
                    "agent exited with {} before becoming ready",
                    status
                ))));
            }
            if ports::is_port_ready(port).await {
                break;
            }
            if started.elapsed() >= self.config.ready_timeout {
                let _ = child.kill().await;
                return Err(PoolError::NotReady {
                    port,
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        info!(port, elapsed_ms = started.elapsed().as_millis() as u64, "agent ready");

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let token = kill.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => warn!(port, %status, "agent process exited"),
                    Err(e) => warn!(port, error = %e, "failed waiting on agent process"),
                },
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(port, error = %e, "failed to kill agent process");
                    }
                }
            }
            let _ = exit_tx.send(());
        });

        Ok(AgentProcess {
            port,
            pid,
            kill,
            exited: exit_rx,
        })
    }
}

async fn forward_output<R>(reader: R, port: u16, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(port, stream, "{}", line);
    }
}
