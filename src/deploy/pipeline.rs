//! Deployment pipeline: one idea applied to one application.
//!
//! A failure before promotion leaves the live tree untouched. A failure
//! during promotion is rolled back. The staging tree is removed after any
//! failed attempt unless promotion preserved it for inspection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::promote::Promoter;
use super::prompt::{PromptContext, build_prompt};
use super::staging;
use crate::apps::{AppMetadata, AppRegistry, AppRunner};
use crate::errors::{AppError, PipelineError, PromoteError, RpcError};
use crate::events::{Event, EventBus, EventScope};
use crate::queue::Idea;
use crate::rpc::turn::connect_with_timeout;
use crate::rpc::{AgentConnector, TurnDriver, TurnOutcome};
use crate::session::SessionProvider;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub apps_dir: PathBuf,
    pub acquire_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            apps_dir: PathBuf::from("generated-apps"),
            acquire_timeout: Duration::from_secs(60),
        }
    }
}

/// Collaborators of the pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
    pub sessions: Arc<dyn SessionProvider>,
    pub connector: Arc<dyn AgentConnector>,
    pub driver: TurnDriver,
    pub registry: Arc<dyn AppRegistry>,
    pub runner: Arc<dyn AppRunner>,
    pub promoter: Arc<dyn Promoter>,
    pub events: EventBus,
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub task_id: String,
    pub idea: Idea,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutcome {
    pub app_id: String,
    pub port: u16,
    pub revision: u32,
    pub created: bool,
    pub summary: String,
}

/// Where an attempt writes, decided before any filesystem work.
struct Target {
    app_id: String,
    port: u16,
    live_meta: Option<AppMetadata>,
}

impl Target {
    fn is_new(&self) -> bool {
        self.live_meta.is_none()
    }
}

pub struct DeploymentPipeline {
    config: PipelineConfig,
    deps: PipelineDeps,
    identity_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
    last_app_millis: AtomicI64,
}

/// Removes a task's cancel token when its attempt ends.
struct CancelRegistration<'a> {
    map: &'a Mutex<HashMap<String, CancellationToken>>,
    task_id: String,
}

impl Drop for CancelRegistration<'_> {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.task_id);
    }
}

impl DeploymentPipeline {
    pub fn new(config: PipelineConfig, deps: PipelineDeps) -> Self {
        Self {
            config,
            deps,
            identity_locks: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            last_app_millis: AtomicI64::new(0),
        }
    }

    pub fn apps_dir(&self) -> &std::path::Path {
        &self.config.apps_dir
    }

    pub fn registry(&self) -> &Arc<dyn AppRegistry> {
        &self.deps.registry
    }

    pub fn runner(&self) -> &Arc<dyn AppRunner> {
        &self.deps.runner
    }

    pub fn events(&self) -> &EventBus {
        &self.deps.events
    }

    /// Cancel the in-flight turn of `task_id`. Returns whether one was found.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self
            .cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> Vec<String> {
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// `app_<unix-millis>`, strictly increasing within this process.
    fn next_app_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut prev = self.last_app_millis.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self.last_app_millis.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return format!("app_{}", next),
                Err(actual) => prev = actual,
            }
        }
    }

    fn identity_lock(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.identity_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(identity.to_string())
            .or_default()
            .clone()
    }

    fn drop_identity_lock(&self, identity: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.identity_locks.lock().unwrap_or_else(|e| e.into_inner());
        // The map holds one reference and `lock` another
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(identity);
        }
    }

    /// Apply one idea to its application.
    ///
    /// Turns for the same identity run one at a time. The task can be
    /// cancelled while it waits for its turn.
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeployOutcome, PipelineError> {
        let cancel = CancellationToken::new();
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request.task_id.clone(), cancel.clone());
        let _registration = CancelRegistration {
            map: &self.cancels,
            task_id: request.task_id.clone(),
        };

        let identity = request.idea.identity.clone();
        let lock = self.identity_lock(&identity);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled(request.task_id.clone())),
            _turn = lock.lock() => self.deploy_locked(&request, &cancel).await,
        };
        self.drop_identity_lock(&identity, lock);
        result
    }

    async fn deploy_locked(
        &self,
        request: &DeployRequest,
        cancel: &CancellationToken,
    ) -> Result<DeployOutcome, PipelineError> {
        let task_id = request.task_id.as_str();
        let identity = request.idea.identity.as_str();

        let target = self.resolve_target(request)?;
        let scope = self.deps.events.scoped(task_id, &target.app_id);
        info!(task_id, app_id = %target.app_id, identity, port = target.port, new = target.is_new(), "deploying idea");

        let staging_dir = staging::staging_dir(&self.config.apps_dir, &target.app_id);
        match self.attempt(request, &target, &scope, cancel).await {
            Ok(outcome) => {
                self.deps.registry.bind_identity(identity, &target.app_id);
                self.deps.registry.clear_pending(identity);
                self.deps.registry.clear_failure(identity);
                scope.emit(Event::finished(true, outcome.summary.clone()));
                info!(task_id, app_id = %outcome.app_id, revision = outcome.revision, "deployment complete");
                Ok(outcome)
            }
            Err(err) => {
                let preserved = matches!(
                    err,
                    PipelineError::Promotion(PromoteError::Swap {
                        staging_preserved: true,
                        ..
                    })
                );
                if preserved {
                    warn!(task_id, path = %staging_dir.display(), "staging kept for inspection");
                } else {
                    staging::remove_staging(&staging_dir);
                }
                if target.is_new() {
                    self.deps.registry.release_port(target.port);
                    self.deps.registry.clear_pending(identity);
                }
                let message = err.to_string();
                self.deps.registry.record_failure(identity, task_id, &message);
                error!(task_id, app_id = %target.app_id, error = %message, "deployment failed");
                scope.emit(Event::error(message.clone()));
                scope.emit(Event::finished(false, message));
                Err(err)
            }
        }
    }

    fn resolve_target(&self, request: &DeployRequest) -> Result<Target, PipelineError> {
        let identity = request.idea.identity.as_str();
        let registry = &self.deps.registry;

        if let Some(app_id) = registry.app_for_identity(identity) {
            let live = self.config.apps_dir.join(&app_id);
            if live.is_dir() {
                let meta = AppMetadata::load(&live)
                    .map_err(|source| AppError::Metadata {
                        app_id: app_id.clone(),
                        source,
                    })?
                    .unwrap_or_else(|| AppMetadata::new(app_id.clone(), identity, 0));
                let port = registry.allocate_port(meta.port.filter(|p| *p != 0))?;
                return Ok(Target {
                    app_id,
                    port,
                    live_meta: Some(meta),
                });
            }
            warn!(identity, app_id = %app_id, "indexed application directory is gone, creating a new one");
        }

        registry.mark_pending(identity, &request.idea.text, &request.task_id);
        let port = match registry.allocate_port(None) {
            Ok(port) => port,
            Err(e) => {
                registry.clear_pending(identity);
                return Err(e.into());
            }
        };
        Ok(Target {
            app_id: self.next_app_id(),
            port,
            live_meta: None,
        })
    }

    async fn attempt(
        &self,
        request: &DeployRequest,
        target: &Target,
        scope: &EventScope,
        cancel: &CancellationToken,
    ) -> Result<DeployOutcome, PipelineError> {
        let apps_dir = &self.config.apps_dir;
        let live_dir = apps_dir.join(&target.app_id);
        let idea = &request.idea;

        // 1. isolated staging copy
        let staging_dir = staging::prepare_staging(apps_dir, &target.app_id)
            .map_err(|e| PipelineError::io(apps_dir.join(staging::STAGING_DIR), e))?;
        if !target.is_new() {
            let copied = staging::copy_live_tree(&live_dir, &staging_dir)
                .map_err(|e| PipelineError::io(&live_dir, e))?;
            scope.emit(Event::status_line(format!("Copied {} files into staging", copied)));
        }

        let mut meta = target
            .live_meta
            .clone()
            .unwrap_or_else(|| AppMetadata::new(target.app_id.clone(), idea.identity.clone(), target.port));
        let revision = match idea.revision {
            Some(r) if r > meta.last_revision.unwrap_or(0) => r,
            _ => meta.next_revision(),
        };
        meta.app_id = target.app_id.clone();
        meta.port = Some(target.port);
        meta.idea_key = Some(idea.identity.clone());
        meta.record_revision(revision, &idea.text);
        meta.save(&staging_dir)
            .map_err(|e| PipelineError::io(AppMetadata::path(&staging_dir), e))?;

        // 2. prompt
        let combined = meta.combined_idea_text();
        let prompt = build_prompt(&PromptContext {
            app_id: &target.app_id,
            app_dir: &staging_dir,
            port: target.port,
            app_name: &meta.name,
            app_type: &meta.app_type,
            combined_idea_text: &combined,
            is_new_app: target.is_new(),
        });

        // 3. session + one turn
        scope.emit(Event::status_line("Waiting for an agent session"));
        let lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled(request.task_id.clone())),
            lease = self.deps.sessions.acquire(&target.app_id, self.config.acquire_timeout) => lease?,
        };
        scope.emit(Event::status_line(format!(
            "Connected to agent on port {}",
            lease.endpoint().port
        )));

        let turn = self.run_turn(&lease, &staging_dir, &prompt, scope, cancel).await;
        let outcome = match turn {
            Ok(outcome) => outcome,
            Err(RpcError::Cancelled) => return Err(PipelineError::Cancelled(request.task_id.clone())),
            Err(e) => return Err(e.into()),
        };

        // 4. validation
        let missing = staging::validate_app_dir(&staging_dir);
        if !missing.is_empty() {
            return Err(PipelineError::Validation { missing });
        }

        // 5. stop before swap
        let was_running = self.deps.runner.status(&target.app_id).is_some();
        if was_running {
            scope.emit(Event::status_line("Stopping running application"));
            self.deps.runner.stop(&target.app_id).await?;
        }

        // 6. promotion
        let promoted = self.deps.promoter.promote(&staging_dir, &live_dir).await?;
        info!(app_id = %target.app_id, ?promoted, "promoted staged tree");

        let output = render_output(&outcome);
        if let Err(e) = record_output(&live_dir, revision, &output) {
            warn!(app_id = %target.app_id, error = %e, "failed to record turn output in metadata");
        }

        // 7. restart without waiting
        if was_running {
            let runner = self.deps.runner.clone();
            let app_id = target.app_id.clone();
            tokio::spawn(async move {
                if let Err(e) = runner.start(&app_id).await {
                    warn!(app_id = %app_id, error = %e, "failed to restart application after deployment");
                }
            });
        }

        // 8. the lease is released on drop
        drop(lease);

        Ok(DeployOutcome {
            app_id: target.app_id.clone(),
            port: target.port,
            revision,
            created: target.is_new(),
            summary: outcome.summary(),
        })
    }

    async fn run_turn(
        &self,
        lease: &crate::session::SessionLease,
        cwd: &std::path::Path,
        prompt: &str,
        scope: &EventScope,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, RpcError> {
        let driver = &self.deps.driver;
        let mut channel = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            channel = connect_with_timeout(
                self.deps.connector.as_ref(),
                lease.endpoint(),
                cwd,
                driver.timeouts().connect,
            ) => channel?,
        };
        let files = staging::context_files(cwd);
        driver
            .run(channel.as_mut(), prompt, &files, scope, cancel)
            .await
    }
}

fn render_output(outcome: &TurnOutcome) -> String {
    let text = if outcome.text.trim().is_empty() {
        "(the agent returned no visible text; changes were likely made through tool calls)"
    } else {
        outcome.text.as_str()
    };
    format!("{}\n\n---\nSummary: {}", text, outcome.summary())
}

fn record_output(live_dir: &std::path::Path, revision: u32, output: &str) -> std::io::Result<()> {
    if let Some(mut meta) = AppMetadata::load(live_dir)? {
        meta.record_output(revision, output);
        meta.save(live_dir)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::apps::MemoryRegistry;
    use crate::apps::tests::FakeRunner;
    use crate::deploy::promote::AtomicSwap;
    use crate::deploy::staging::REQUIRED_FILES;
    use crate::errors::PoolError;
    use crate::queue::{Priority, Retryable};
    use crate::rpc::AgentChannel;
    use crate::rpc::turn::tests::{ScriptedChannel, Scripted, chunk, finished};
    use crate::session::{AgentEndpoint, PoolStatus, SessionLease};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    #[derive(Default)]
    pub(crate) struct FakeSessions {
        acquired: AtomicUsize,
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionProvider for FakeSessions {
        async fn acquire(&self, app_id: &str, _timeout: Duration) -> Result<SessionLease, PoolError> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            let released = self.released.clone();
            Ok(SessionLease::new(AgentEndpoint::local(47700), app_id, move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
        }

        fn status(&self) -> PoolStatus {
            PoolStatus {
                mode: "fake",
                total: 0,
                idle: 0,
                busy: 0,
                starting: 0,
                max: 1,
                waiting: 0,
                sessions: Vec::new(),
            }
        }

        async fn shutdown(&self) {}
    }

    /// Writes `files` into the working directory, then plays `script`.
    pub(crate) struct WritingConnector {
        pub(crate) files: Vec<&'static str>,
        pub(crate) script: Vec<Scripted>,
    }

    #[async_trait]
    impl AgentConnector for WritingConnector {
        async fn connect(&self, _endpoint: &AgentEndpoint, cwd: &Path) -> Result<Box<dyn AgentChannel>, RpcError> {
            for file in &self.files {
                let path = cwd.join(file);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, format!("// generated {}", file)).unwrap();
            }
            let (channel, _log) = ScriptedChannel::new(self.script.clone());
            Ok(Box::new(channel))
        }
    }

    struct Harness {
        _tmp: TempDir,
        apps_dir: PathBuf,
        pipeline: Arc<DeploymentPipeline>,
        registry: Arc<MemoryRegistry>,
        runner: Arc<FakeRunner>,
        sessions: Arc<FakeSessions>,
    }

    fn harness(files: Vec<&'static str>, script: Vec<Scripted>) -> Harness {
        let tmp = TempDir::new().unwrap();
        let apps_dir = tmp.path().join("generated-apps");
        std::fs::create_dir_all(&apps_dir).unwrap();
        let registry = Arc::new(MemoryRegistry::new(3001, 3999));
        let runner = Arc::new(FakeRunner::default());
        let sessions = Arc::new(FakeSessions::default());
        let pipeline = DeploymentPipeline::new(
            PipelineConfig {
                apps_dir: apps_dir.clone(),
                acquire_timeout: Duration::from_secs(5),
            },
            PipelineDeps {
                sessions: sessions.clone(),
                connector: Arc::new(WritingConnector { files, script }),
                driver: TurnDriver::default(),
                registry: registry.clone(),
                runner: runner.clone(),
                promoter: Arc::new(AtomicSwap::default()),
                events: EventBus::default(),
            },
        );
        Harness {
            _tmp: tmp,
            apps_dir,
            pipeline: Arc::new(pipeline),
            registry,
            runner,
            sessions,
        }
    }

    /// A second pipeline over the same apps dir, registry and runner.
    fn pipeline_with(
        h: &Harness,
        sessions: Arc<dyn SessionProvider>,
        connector: Arc<dyn AgentConnector>,
    ) -> DeploymentPipeline {
        DeploymentPipeline::new(
            PipelineConfig {
                apps_dir: h.apps_dir.clone(),
                acquire_timeout: Duration::from_secs(3600),
            },
            PipelineDeps {
                sessions,
                connector,
                driver: TurnDriver::default(),
                registry: h.registry.clone(),
                runner: h.runner.clone(),
                promoter: Arc::new(AtomicSwap::default()),
                events: EventBus::default(),
            },
        )
    }

    /// Never grants a session; gives up when the acquire timeout elapses.
    #[derive(Default)]
    struct StalledSessions {
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl SessionProvider for StalledSessions {
        async fn acquire(&self, app_id: &str, timeout: Duration) -> Result<SessionLease, PoolError> {
            self.entered.notify_one();
            tokio::time::sleep(timeout).await;
            Err(PoolError::AcquireTimeout {
                app_id: app_id.to_string(),
                waited: timeout,
            })
        }

        fn status(&self) -> PoolStatus {
            FakeSessions::default().status()
        }

        async fn shutdown(&self) {}
    }

    /// Deletes `removed` from the working directory, then plays `script`.
    struct DeletingConnector {
        removed: Vec<&'static str>,
        script: Vec<Scripted>,
    }

    #[async_trait]
    impl AgentConnector for DeletingConnector {
        async fn connect(&self, _endpoint: &AgentEndpoint, cwd: &Path) -> Result<Box<dyn AgentChannel>, RpcError> {
            for file in &self.removed {
                std::fs::remove_file(cwd.join(file)).unwrap();
            }
            let (channel, _log) = ScriptedChannel::new(self.script.clone());
            Ok(Box::new(channel))
        }
    }

    fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(dir).unwrap().to_path_buf();
                (rel, std::fs::read(e.path()).unwrap())
            })
            .collect()
    }

    fn request(task_id: &str, identity: &str, text: &str) -> DeployRequest {
        DeployRequest {
            task_id: task_id.to_string(),
            idea: Idea::new(identity, text, Priority::Medium),
        }
    }

    fn ok_script() -> Vec<Scripted> {
        vec![chunk("Built the app"), finished()]
    }

    #[tokio::test]
    async fn test_first_deploy_creates_application() {
        let h = harness(REQUIRED_FILES.to_vec(), ok_script());
        let outcome = h.pipeline.deploy(request("task_1", "a.txt", "add a counter button")).await.unwrap();

        assert!(outcome.created);
        assert_eq!(outcome.revision, 1);
        assert_eq!(outcome.port, 3001);
        let live = h.apps_dir.join(&outcome.app_id);
        assert!(staging::validate_app_dir(&live).is_empty());

        let meta = AppMetadata::load(&live).unwrap().unwrap();
        assert_eq!(meta.idea_key.as_deref(), Some("a.txt"));
        assert_eq!(meta.last_revision, Some(1));
        assert!(meta.last_output_preview.starts_with("Built the app"));
        assert!(meta.idea_history[0].assistant_preview.is_some());

        assert_eq!(h.registry.app_for_identity("a.txt"), Some(outcome.app_id.clone()));
        assert!(h.registry.pending().is_empty());
        assert!(!staging::staging_dir(&h.apps_dir, &outcome.app_id).exists());
        assert_eq!(h.sessions.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_deploy_reuses_app_and_restarts_running_process() {
        let h = harness(REQUIRED_FILES.to_vec(), ok_script());
        let first = h.pipeline.deploy(request("task_1", "a.txt", "add a counter")).await.unwrap();
        h.runner.running.lock().unwrap().insert(first.app_id.clone(), first.port);

        let second = h.pipeline.deploy(request("task_2", "a.txt", "now style it")).await.unwrap();
        assert_eq!(second.app_id, first.app_id);
        assert_eq!(second.port, first.port);
        assert_eq!(second.revision, 2);
        assert!(!second.created);

        let meta = AppMetadata::load(&h.apps_dir.join(&first.app_id)).unwrap().unwrap();
        assert_eq!(meta.idea_history.len(), 2);
        assert_eq!(*h.runner.stops.lock().unwrap(), vec![first.app_id.clone()]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*h.runner.starts.lock().unwrap(), vec![first.app_id.clone()]);
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_nothing_behind() {
        let h = harness(vec!["package.json"], ok_script());
        let err = h.pipeline.deploy(request("task_1", "a.txt", "idea")).await.unwrap_err();

        match &err {
            PipelineError::Validation { missing } => assert!(missing.contains(&"server.js".to_string())),
            other => panic!("Expected Validation, got {:?}", other),
        }
        assert!(err.is_retryable());

        let listed: Vec<_> = std::fs::read_dir(&h.apps_dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.'))
            .collect();
        assert!(listed.is_empty());
        let staging_root = h.apps_dir.join(staging::STAGING_DIR);
        assert_eq!(std::fs::read_dir(staging_root).unwrap().count(), 0);

        assert!(h.registry.app_for_identity("a.txt").is_none());
        assert!(h.registry.pending().is_empty());
        assert!(h.registry.used_ports().is_empty());
        assert!(h.registry.last_failure("a.txt").unwrap().message.contains("server.js"));
        assert_eq!(h.sessions.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_iteration_keeps_live_tree() {
        let h = harness(REQUIRED_FILES.to_vec(), ok_script());
        let first = h.pipeline.deploy(request("task_1", "a.txt", "v1")).await.unwrap();
        let live = h.apps_dir.join(&first.app_id);
        std::fs::write(live.join("server.js"), "live v1").unwrap();

        // Same pipeline state, new connector whose turn closes early
        let h2 = pipeline_with(
            &h,
            h.sessions.clone(),
            Arc::new(WritingConnector {
                files: vec!["server.js"],
                script: vec![chunk("partial"), Scripted::Close],
            }),
        );
        let err = h2.deploy(request("task_2", "a.txt", "v2")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Rpc(RpcError::ChannelClosed)));
        assert_eq!(std::fs::read_to_string(live.join("server.js")).unwrap(), "live v1");
        assert_eq!(h.registry.app_for_identity("a.txt"), Some(first.app_id.clone()));
        assert!(h.registry.used_ports().contains(&first.port));
    }

    #[tokio::test]
    async fn test_validation_failure_keeps_existing_app_intact() {
        let h = harness(REQUIRED_FILES.to_vec(), ok_script());
        let first = h.pipeline.deploy(request("task_1", "a.txt", "v1")).await.unwrap();
        let live = h.apps_dir.join(&first.app_id);
        std::fs::write(live.join("server.js"), "live v1").unwrap();
        let before = snapshot(&live);

        let broken = pipeline_with(
            &h,
            h.sessions.clone(),
            Arc::new(DeletingConnector {
                removed: vec!["server.js"],
                script: ok_script(),
            }),
        );
        let err = broken.deploy(request("task_2", "a.txt", "v2")).await.unwrap_err();

        match &err {
            PipelineError::Validation { missing } => assert_eq!(missing, &vec!["server.js".to_string()]),
            other => panic!("Expected Validation, got {:?}", other),
        }
        assert_eq!(snapshot(&live), before);
        assert!(!staging::staging_dir(&h.apps_dir, &first.app_id).exists());
        assert_eq!(h.registry.app_for_identity("a.txt"), Some(first.app_id.clone()));
        assert!(h.registry.used_ports().contains(&first.port));
        assert!(h.registry.pending().is_empty());
        assert!(h.runner.stops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_session() {
        let h = harness(REQUIRED_FILES.to_vec(), ok_script());
        let sessions = Arc::new(StalledSessions::default());
        let entered = sessions.entered.clone();
        let pipeline = Arc::new(pipeline_with(
            &h,
            sessions,
            Arc::new(WritingConnector {
                files: REQUIRED_FILES.to_vec(),
                script: ok_script(),
            }),
        ));

        let deploying = pipeline.clone();
        let handle = tokio::spawn(async move { deploying.deploy(request("task_c", "a.txt", "idea")).await });
        entered.notified().await;
        assert!(pipeline.cancel("task_c"));

        let err = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("deploy did not stop after cancel")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(ref id) if id == "task_c"));
        assert!(!err.is_retryable());
        assert!(pipeline.in_flight().is_empty());
        assert!(h.registry.pending().is_empty());
        assert!(h.registry.used_ports().is_empty());
        let staging_root = h.apps_dir.join(staging::STAGING_DIR);
        assert_eq!(std::fs::read_dir(staging_root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_turn() {
        let h = harness(
            REQUIRED_FILES.to_vec(),
            vec![Scripted::Stall(Duration::from_secs(3600))],
        );
        let pipeline = h.pipeline.clone();
        let handle = tokio::spawn(async move { pipeline.deploy(request("task_9", "a.txt", "idea")).await });

        for _ in 0..100 {
            if h.pipeline.cancel("task_9") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(ref id) if id == "task_9"));
        assert!(!err.is_retryable());
        assert!(h.pipeline.in_flight().is_empty());
        assert!(!h.pipeline.cancel("task_9"));
    }

    #[tokio::test]
    async fn test_events_tagged_with_task_and_app() {
        let h = harness(REQUIRED_FILES.to_vec(), ok_script());
        let mut rx = h.pipeline.events().subscribe();
        let outcome = h.pipeline.deploy(request("task_1", "a.txt", "idea")).await.unwrap();

        let mut saw_finished = false;
        while let Ok(envelope) = rx.try_recv() {
            assert_eq!(envelope.task_id.as_deref(), Some("task_1"));
            assert_eq!(envelope.app_id.as_deref(), Some(outcome.app_id.as_str()));
            if let Event::Finished { success, .. } = envelope.event {
                assert!(success);
                saw_finished = true;
            }
        }
        assert!(saw_finished);
    }

    #[test]
    fn test_app_ids_strictly_increase() {
        let h = harness(vec![], vec![]);
        let a = h.pipeline.next_app_id();
        let b = h.pipeline.next_app_id();
        let millis = |id: &str| id.trim_start_matches("app_").parse::<i64>().unwrap();
        assert!(millis(&b) > millis(&a));
    }
}
