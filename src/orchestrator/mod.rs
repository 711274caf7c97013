//! Wires the queue, deployment pipeline, session provider and fleet
//! controller together and exposes the ingress control operations.
//!
//! | Operation              | Backed by                     |
//! |------------------------|-------------------------------|
//! | `submit_idea`          | `TaskQueue::submit`           |
//! | `list_applications`    | apps dir + registry + runner  |
//! | `start/stop_application` | `AppRunner`                 |
//! | `start/stop_iteration` | `FleetController`             |
//! | `session_status`       | `SessionProvider::status`     |
//!
//! The dispatcher task drains the queue into the pipeline; the fleet
//! controller submits its own turns straight to the pipeline.

mod dispatcher;
pub mod submitter;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::apps::{
    AppRegistry, AppRunner, AppStatus, AppSummary, MemoryRegistry, ProcessRunner, is_valid_app_id,
    list_applications,
};
use crate::config::ForgeConfig;
use crate::deploy::staging::clean_staging_root;
use crate::deploy::{AtomicSwap, DeploymentPipeline, PipelineConfig, PipelineDeps};
use crate::errors::{AppError, FleetError, SubmitError};
use crate::events::{Event, EventBus, EventEnvelope};
use crate::fleet::{Dimension, FleetConfig, FleetController, JsonFileStore, LoopState, StateStore, StationStats};
use crate::queue::{Idea, QueueConfig, QueueDetails, QueueStats, TaskQueue};
use crate::rpc::turn::approval_unavailable;
use crate::rpc::{TurnDriver, WsConnector};
use crate::session::{AgentSpawner, CommandSpawner, PoolStatus, SessionPool, SessionProvider, SingleSession};

use dispatcher::spawn_dispatcher;
pub use submitter::PipelineSubmitter;

/// How long shutdown waits for each background task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything the orchestrator is assembled from.
pub struct OrchestratorParts {
    pub queue: QueueConfig,
    pub max_concurrent_tasks: usize,
    pub pipeline: PipelineConfig,
    pub deps: PipelineDeps,
    pub fleet: FleetConfig,
    pub fleet_store: Arc<dyn StateStore>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    pub stats: StationStats,
    pub loops: Vec<LoopState>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFailure {
    pub app_id: String,
    pub error: String,
}

/// Result of a start-all / stop-all sweep.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<BulkFailure>,
}

pub struct Orchestrator {
    queue: Arc<TaskQueue>,
    pipeline: Arc<DeploymentPipeline>,
    sessions: Arc<dyn SessionProvider>,
    fleet: FleetController,
    events: EventBus,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Assemble from parts and start the dispatcher and fleet controller.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(parts: OrchestratorParts) -> Arc<Self> {
        let OrchestratorParts {
            queue,
            max_concurrent_tasks,
            pipeline,
            deps,
            fleet,
            fleet_store,
        } = parts;

        let removed = clean_staging_root(&pipeline.apps_dir);
        if removed > 0 {
            info!(removed, "removed leftover staging directories");
        }

        let events = deps.events.clone();
        let sessions = deps.sessions.clone();
        let pipeline = Arc::new(DeploymentPipeline::new(pipeline, deps));
        let queue = Arc::new(TaskQueue::new(queue));

        let submitter = Arc::new(PipelineSubmitter::new(pipeline.clone()));
        let (fleet, fleet_handle) = FleetController::spawn(fleet, fleet_store, submitter, events.clone());

        let shutdown = CancellationToken::new();
        let dispatcher = spawn_dispatcher(
            queue.clone(),
            pipeline.clone(),
            fleet.clone(),
            max_concurrent_tasks,
            shutdown.clone(),
        );

        Arc::new(Self {
            queue,
            pipeline,
            sessions,
            fleet,
            events,
            shutdown,
            background: Mutex::new(vec![dispatcher, fleet_handle]),
        })
    }

    /// Build the production component graph from configuration.
    pub fn from_config(config: &ForgeConfig) -> Result<Arc<Self>> {
        let apps_dir = config.apps_dir();
        std::fs::create_dir_all(&apps_dir)
            .with_context(|| format!("Failed to create apps directory: {}", apps_dir.display()))?;

        let runner_config = config.runner_config();
        let registry: Arc<dyn AppRegistry> = Arc::new(MemoryRegistry::scan(
            &apps_dir,
            runner_config.port_start,
            runner_config.port_end,
        ));
        let runner: Arc<dyn AppRunner> = Arc::new(ProcessRunner::new(&apps_dir, runner_config, registry.clone()));

        let spawner: Arc<dyn AgentSpawner> = Arc::new(CommandSpawner::new(config.spawn_config()));
        let mut reaper = None;
        let sessions: Arc<dyn SessionProvider> = if config.toml.pool.single_session {
            info!("using a single shared agent session");
            Arc::new(SingleSession::new(config.single_session_config(), spawner))
        } else {
            let pool = SessionPool::new(config.pool_config(), spawner);
            reaper = Some(pool.start_reaper());
            Arc::new(pool)
        };

        let policy = config.approval_policy();
        if approval_unavailable(&policy, None) {
            warn!("approval mode is manual but no approver is attached; turns that need approval will fail");
        }

        let orchestrator = Self::start(OrchestratorParts {
            queue: config.queue_config(),
            max_concurrent_tasks: config.max_concurrent_tasks(),
            pipeline: config.pipeline_config(),
            deps: PipelineDeps {
                sessions,
                connector: Arc::new(WsConnector::default()),
                driver: TurnDriver::new(config.turn_timeouts(), policy),
                registry,
                runner,
                promoter: Arc::new(AtomicSwap::default()),
                events: EventBus::default(),
            },
            fleet: config.fleet_config(),
            fleet_store: Arc::new(JsonFileStore::in_dir(config.data_dir())),
        });
        if let Some(handle) = reaper {
            orchestrator.track(handle);
        }
        Ok(orchestrator)
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    // --- ideas and tasks ---

    pub fn submit_idea(&self, idea: Idea) -> Result<String, SubmitError> {
        let identity = idea.identity.clone();
        let task_id = self.queue.submit(idea)?;
        self.events.emit(
            Some(&task_id),
            None,
            Event::status_line(format!("Queued idea '{}'", identity)),
        );
        Ok(task_id)
    }

    pub fn list_tasks(&self) -> QueueDetails {
        self.queue.details()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn session_status(&self) -> PoolStatus {
        self.sessions.status()
    }

    // --- applications ---

    pub fn list_applications(&self) -> Vec<AppSummary> {
        list_applications(
            self.pipeline.apps_dir(),
            self.pipeline.registry().as_ref(),
            self.pipeline.runner().as_ref(),
        )
    }

    pub async fn start_application(&self, app_id: &str) -> Result<u16, AppError> {
        check_app_id(app_id)?;
        let port = self.pipeline.runner().start(app_id).await?;
        self.events
            .emit(None, Some(app_id), Event::status_line(format!("Started on port {}", port)));
        Ok(port)
    }

    /// Returns whether the app was running.
    pub async fn stop_application(&self, app_id: &str) -> Result<bool, AppError> {
        check_app_id(app_id)?;
        let was_running = self.pipeline.runner().stop(app_id).await?;
        if was_running {
            self.events.emit(None, Some(app_id), Event::status_line("Stopped"));
        }
        Ok(was_running)
    }

    /// Start every stopped application on disk.
    pub async fn start_all_apps(&self) -> BulkResult {
        let mut result = BulkResult::default();
        for app in self.list_applications() {
            if app.status != AppStatus::Stopped {
                continue;
            }
            match self.pipeline.runner().start(&app.app_id).await {
                Ok(_) => result.succeeded.push(app.app_id),
                Err(e) => {
                    warn!(app_id = %app.app_id, error = %e, "failed to start application");
                    result.failed.push(BulkFailure {
                        app_id: app.app_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        result
    }

    pub async fn stop_all_apps(&self) -> BulkResult {
        let mut result = BulkResult::default();
        for app_id in self.pipeline.runner().running() {
            match self.pipeline.runner().stop(&app_id).await {
                Ok(_) => result.succeeded.push(app_id),
                Err(e) => {
                    warn!(app_id = %app_id, error = %e, "failed to stop application");
                    result.failed.push(BulkFailure {
                        app_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        result
    }

    // --- iteration loops ---

    pub async fn start_iteration(&self, app_id: &str) -> Result<LoopState, FleetError> {
        self.fleet.start(app_id).await
    }

    pub async fn stop_iteration(&self, app_id: &str) -> Result<LoopState, FleetError> {
        self.fleet.stop(app_id).await
    }

    pub async fn set_focus_dimension(
        &self,
        app_id: &str,
        focus: Option<Dimension>,
    ) -> Result<LoopState, FleetError> {
        self.fleet.set_focus(app_id, focus).await
    }

    pub async fn update_dimensions(
        &self,
        app_id: &str,
        dimensions: Vec<Dimension>,
    ) -> Result<LoopState, FleetError> {
        self.fleet.update_dimensions(app_id, dimensions).await
    }

    pub async fn iteration_state(&self, app_id: &str) -> Result<Option<LoopState>, FleetError> {
        self.fleet.state(app_id).await
    }

    pub async fn fleet_status(&self) -> Result<FleetStatus, FleetError> {
        Ok(FleetStatus {
            stats: self.fleet.station_stats().await?,
            loops: self.fleet.all_states().await?,
        })
    }

    pub async fn stop_all_iterations(&self) -> Result<usize, FleetError> {
        self.fleet.stop_all().await
    }

    /// Stop dispatching, cancel in-flight turns, stop applications and
    /// agent sessions. Enabled iteration loops stay enabled on disk.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.shutdown.cancel();

        if let Err(e) = self.fleet.shutdown().await {
            debug!(error = %e, "fleet controller already stopped");
        }
        for task_id in self.pipeline.in_flight() {
            self.pipeline.cancel(&task_id);
        }

        let stopped = self.stop_all_apps().await;
        if !stopped.succeeded.is_empty() {
            info!(count = stopped.succeeded.len(), "stopped running applications");
        }
        self.sessions.shutdown().await;

        let handles = std::mem::take(&mut *self.background.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("background task did not stop in time");
            }
        }
    }
}

fn check_app_id(app_id: &str) -> Result<(), AppError> {
    if is_valid_app_id(app_id) {
        Ok(())
    } else {
        Err(AppError::NotFound(app_id.to_string()))
    }
}
