//! Generated-application process control.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::metadata::AppMetadata;
use super::registry::AppRegistry;
use crate::errors::AppError;
use crate::ports;

/// After this long without a port announcement a started app counts as running.
const STARTING_GRACE: Duration = Duration::from_secs(1);

static CONST_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"const\s+PORT\s*=\s*(\d+)\s*;").unwrap());
static LISTEN_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(app|server)\.listen\(\s*(\d+)\s*(,|\))").unwrap());
static CONST_PORT_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bconst\s+PORT\b").unwrap());
static APP_DECL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*const\s+(app|server)\s*=.*$").unwrap());
static EXPRESS_DECL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*const\s+express\s*=.*$").unwrap());
static LOCALHOST_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"localhost:(\d+)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Starting,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningApp {
    pub port: u16,
    pub status: RunState,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait AppRunner: Send + Sync {
    /// Start the app and return its port. Already running apps keep their port.
    async fn start(&self, app_id: &str) -> Result<u16, AppError>;

    /// Stop the app. `Ok(false)` if it was not running.
    async fn stop(&self, app_id: &str) -> Result<bool, AppError>;

    fn status(&self, app_id: &str) -> Option<RunningApp>;

    fn running(&self) -> Vec<String>;
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub port_start: u16,
    pub port_end: u16,
    pub stop_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            args: vec!["server.js".to_string()],
            port_start: 3001,
            port_end: 3999,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

struct ActiveApp {
    info: RunningApp,
    generation: u64,
    kill: CancellationToken,
    exited: CancellationToken,
}

#[derive(Default)]
struct ActiveTable {
    apps: HashMap<String, ActiveApp>,
    next_generation: u64,
}

/// Runs each application as a child process with `PORT` set.
#[derive(Clone)]
pub struct ProcessRunner {
    apps_dir: PathBuf,
    config: RunnerConfig,
    registry: Arc<dyn AppRegistry>,
    active: Arc<Mutex<ActiveTable>>,
}

impl ProcessRunner {
    pub fn new(apps_dir: impl Into<PathBuf>, config: RunnerConfig, registry: Arc<dyn AppRegistry>) -> Self {
        Self {
            apps_dir: apps_dir.into(),
            config,
            registry,
            active: Arc::new(Mutex::new(ActiveTable::default())),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, ActiveTable> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The metadata port if it is free, else the first free port in range.
    fn choose_port(&self, preferred: Option<u16>) -> Result<u16, AppError> {
        if let Some(port) = preferred
            && ports::is_port_free(port)
        {
            return Ok(port);
        }
        let mut held: HashSet<u16> = self.registry.used_ports().into_iter().collect();
        held.extend(self.table().apps.values().map(|a| a.info.port));
        if let Some(port) = preferred {
            held.insert(port);
        }
        ports::find_free_port(self.config.port_start, self.config.port_end, &held).ok_or(
            AppError::NoFreePort {
                start: self.config.port_start,
                end: self.config.port_end,
            },
        )
    }

    fn mark_running(active: &Mutex<ActiveTable>, app_id: &str, generation: u64) {
        let mut table = active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(app) = table.apps.get_mut(app_id)
            && app.generation == generation
        {
            app.info.status = RunState::Running;
        }
    }
}

#[async_trait]
impl AppRunner for ProcessRunner {
    async fn start(&self, app_id: &str) -> Result<u16, AppError> {
        if let Some(app) = self.table().apps.get(app_id) {
            return Ok(app.info.port);
        }

        let dir = self.apps_dir.join(app_id);
        if !dir.join("package.json").exists() {
            return Err(AppError::NotFound(app_id.to_string()));
        }
        let metadata_err = |source| AppError::Metadata {
            app_id: app_id.to_string(),
            source,
        };
        let mut metadata = AppMetadata::load(&dir).map_err(metadata_err)?;
        let preferred = metadata.as_ref().and_then(|m| m.port);
        let port = self.choose_port(preferred)?;

        if let Some(meta) = metadata.as_mut()
            && meta.port != Some(port)
        {
            info!(app_id, old = ?meta.port, port, "reassigning application port");
            if let Some(old) = meta.port {
                self.registry.release_port(old);
            }
            meta.port = Some(port);
            meta.save(&dir).map_err(metadata_err)?;
        }
        self.registry.allocate_port(Some(port))?;

        if let Err(e) = ensure_server_uses_env_port(&dir) {
            warn!(app_id, error = %e, "could not rewrite server.js port (continuing)");
        }

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .current_dir(&dir)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AppError::Spawn {
                app_id: app_id.to_string(),
                source,
            })?;
        info!(app_id, port, pid = child.id(), "started application");

        let kill = CancellationToken::new();
        let exited = CancellationToken::new();
        let generation = {
            let mut table = self.table();
            table.next_generation += 1;
            let generation = table.next_generation;
            table.apps.insert(
                app_id.to_string(),
                ActiveApp {
                    info: RunningApp {
                        port,
                        status: RunState::Starting,
                        started_at: Utc::now(),
                    },
                    generation,
                    kill: kill.clone(),
                    exited: exited.clone(),
                },
            );
            generation
        };

        if let Some(stdout) = child.stdout.take() {
            let active = self.active.clone();
            let id = app_id.to_string();
            tokio::spawn(watch_output(stdout, move |line| {
                debug!(app_id = %id, "{}", line);
                if LOCALHOST_PORT.is_match(line) {
                    Self::mark_running(&active, &id, generation);
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let id = app_id.to_string();
            tokio::spawn(watch_output(stderr, move |line| {
                if line.contains("EADDRINUSE") {
                    warn!(app_id = %id, "{}", line);
                } else {
                    debug!(app_id = %id, stream = "stderr", "{}", line);
                }
            }));
        }

        let active = self.active.clone();
        let id = app_id.to_string();
        tokio::spawn(async move {
            let grace = tokio::time::sleep(STARTING_GRACE);
            tokio::pin!(grace);
            let mut graced = false;
            loop {
                tokio::select! {
                    _ = &mut grace, if !graced => {
                        graced = true;
                        Self::mark_running(&active, &id, generation);
                    }
                    status = child.wait() => {
                        match status {
                            Ok(status) => info!(app_id = %id, %status, "application exited"),
                            Err(e) => warn!(app_id = %id, error = %e, "failed waiting on application"),
                        }
                        break;
                    }
                    _ = kill.cancelled() => {
                        if let Err(e) = child.kill().await {
                            warn!(app_id = %id, error = %e, "failed to kill application");
                        }
                        break;
                    }
                }
            }
            let mut table = active.lock().unwrap_or_else(|e| e.into_inner());
            if table.apps.get(&id).is_some_and(|a| a.generation == generation) {
                table.apps.remove(&id);
            }
            drop(table);
            exited.cancel();
        });

        Ok(port)
    }

    async fn stop(&self, app_id: &str) -> Result<bool, AppError> {
        let tokens = self
            .table()
            .apps
            .get(app_id)
            .map(|a| (a.kill.clone(), a.exited.clone(), a.generation));
        let Some((kill, exited, generation)) = tokens else {
            return Ok(false);
        };

        info!(app_id, "stopping application");
        kill.cancel();
        if tokio::time::timeout(self.config.stop_timeout, exited.cancelled())
            .await
            .is_err()
        {
            let mut table = self.table();
            if table.apps.get(app_id).is_some_and(|a| a.generation == generation) {
                table.apps.remove(app_id);
            }
            warn!(app_id, "application did not stop in time");
            return Err(AppError::StopTimeout {
                app_id: app_id.to_string(),
                waited: self.config.stop_timeout,
            });
        }
        Ok(true)
    }

    fn status(&self, app_id: &str) -> Option<RunningApp> {
        self.table().apps.get(app_id).map(|a| a.info.clone())
    }

    fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.table().apps.keys().cloned().collect();
        ids.sort();
        ids
    }
}

async fn watch_output<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        on_line(&line);
    }
}

/// Make `server.js` honour `PORT` from the environment, keeping the
/// hard-coded port as fallback. Returns whether the file changed.
pub fn ensure_server_uses_env_port(app_dir: &Path) -> std::io::Result<bool> {
    let path = app_dir.join("server.js");
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let next = rewrite_listen_port(&content);
    if next == content {
        return Ok(false);
    }
    std::fs::write(&path, next)?;
    Ok(true)
}

fn rewrite_listen_port(content: &str) -> String {
    let next = CONST_PORT
        .replacen(content, 1, "const PORT = parseInt(process.env.PORT || '$1', 10);")
        .into_owned();
    if next != content || content.contains("process.env.PORT") {
        return next;
    }

    let Some(caps) = LISTEN_LITERAL.captures(content) else {
        return next;
    };
    let port = caps[2].to_string();
    let mut next = content.to_string();
    if !CONST_PORT_DECL.is_match(&next) {
        let decl = format!("const PORT = parseInt(process.env.PORT || '{}', 10);", port);
        next = match APP_DECL_LINE
            .find(&next)
            .or_else(|| EXPRESS_DECL_LINE.find(&next))
        {
            Some(m) => format!("{}\n{}\n{}", &next[..m.end()], decl, &next[m.end()..]),
            None => format!("{}\n{}", decl, next),
        };
    }
    LISTEN_LITERAL
        .replace_all(&next, "$1.listen(PORT$3")
        .into_owned()
}
