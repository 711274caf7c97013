//! Fleet controller: one perpetual improvement loop per application.
//!
//! All loop records live inside a single actor task. Control calls, rest
//! timers and finished turns arrive as [`Command`]s on one channel, so
//! transitions are applied one at a time. Timers carry the generation they
//! were armed with; bumping an entry's generation disarms them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::dimensions::{Dimension, build_iteration_prompt};
use super::state::{LoopState, LoopStatus, backoff_delay, iteration_task_id};
use super::store::{LoopStates, StateStore};
use crate::errors::{FleetError, PipelineError};
use crate::events::{Event, EventBus};

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub max_concurrent: usize,
    pub rest_interval: Duration,
    /// Delay before resumed loops run their first turn.
    pub first_delay: Duration,
    pub zombie_timeout: Duration,
    pub sweep_interval: Duration,
    pub circuit_threshold: u32,
    pub auto_start_on_create: bool,
    pub auto_start_delay: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            rest_interval: Duration::from_secs(30),
            first_delay: Duration::from_secs(2),
            zombie_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            circuit_threshold: 5,
            auto_start_on_create: false,
            auto_start_delay: Duration::from_secs(5),
        }
    }
}

/// How the fleet reaches the deployment pipeline.
#[async_trait]
pub trait IterationSubmitter: Send + Sync {
    /// Whether `app_id` exists and has an idea identity to iterate on.
    fn has_app(&self, app_id: &str) -> bool;

    /// Run one improvement turn. Returns the turn summary.
    async fn iterate(&self, app_id: &str, task_id: &str, prompt: String) -> Result<String, PipelineError>;

    /// Best-effort cancel of an in-flight turn.
    fn cancel(&self, task_id: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationStats {
    pub total: usize,
    pub idle: usize,
    pub working: usize,
    pub resting: usize,
    pub paused: usize,
    pub total_iterations: u64,
    pub max_concurrent: usize,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Start {
        app_id: String,
        reply: Reply<Result<LoopState, FleetError>>,
    },
    Stop {
        app_id: String,
        reply: Reply<Result<LoopState, FleetError>>,
    },
    SetFocus {
        app_id: String,
        focus: Option<Dimension>,
        reply: Reply<LoopState>,
    },
    UpdateDimensions {
        app_id: String,
        dimensions: Vec<Dimension>,
        reply: Reply<Result<LoopState, FleetError>>,
    },
    Get {
        app_id: String,
        reply: Reply<Option<LoopState>>,
    },
    All {
        reply: Reply<Vec<LoopState>>,
    },
    Stats {
        reply: Reply<StationStats>,
    },
    StopAll {
        reply: Reply<usize>,
    },
    AppCreated {
        app_id: String,
    },
    AutoStart {
        app_id: String,
    },
    Tick {
        app_id: String,
        generation: u64,
    },
    TurnDone {
        app_id: String,
        task_id: String,
        result: Result<String, String>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Handle to the controller actor. Cheap to clone.
#[derive(Clone)]
pub struct FleetController {
    tx: mpsc::Sender<Command>,
}

impl FleetController {
    /// Load persisted records, resume enabled loops and start the actor.
    pub fn spawn(
        config: FleetConfig,
        store: Arc<dyn StateStore>,
        submitter: Arc<dyn IterationSubmitter>,
        events: EventBus,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let actor = Actor::new(config, store, submitter, events, tx.downgrade());
        let handle = tokio::spawn(actor.run(rx));
        (Self { tx }, handle)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, FleetError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| FleetError::ControllerStopped)?;
        rx.await.map_err(|_| FleetError::ControllerStopped)
    }

    pub async fn start(&self, app_id: &str) -> Result<LoopState, FleetError> {
        let app_id = app_id.to_string();
        self.request(|reply| Command::Start { app_id, reply }).await?
    }

    pub async fn stop(&self, app_id: &str) -> Result<LoopState, FleetError> {
        let app_id = app_id.to_string();
        self.request(|reply| Command::Stop { app_id, reply }).await?
    }

    pub async fn set_focus(&self, app_id: &str, focus: Option<Dimension>) -> Result<LoopState, FleetError> {
        let app_id = app_id.to_string();
        self.request(|reply| Command::SetFocus { app_id, focus, reply })
            .await
    }

    pub async fn update_dimensions(
        &self,
        app_id: &str,
        dimensions: Vec<Dimension>,
    ) -> Result<LoopState, FleetError> {
        let app_id = app_id.to_string();
        self.request(|reply| Command::UpdateDimensions {
            app_id,
            dimensions,
            reply,
        })
        .await?
    }

    pub async fn state(&self, app_id: &str) -> Result<Option<LoopState>, FleetError> {
        let app_id = app_id.to_string();
        self.request(|reply| Command::Get { app_id, reply }).await
    }

    pub async fn all_states(&self) -> Result<Vec<LoopState>, FleetError> {
        self.request(|reply| Command::All { reply }).await
    }

    pub async fn station_stats(&self) -> Result<StationStats, FleetError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Pause every loop. Returns how many were enabled.
    pub async fn stop_all(&self) -> Result<usize, FleetError> {
        self.request(|reply| Command::StopAll { reply }).await
    }

    /// Notify the controller that a first deployment created `app_id`.
    pub async fn app_created(&self, app_id: &str) {
        let app_id = app_id.to_string();
        if self.tx.send(Command::AppCreated { app_id }).await.is_err() {
            debug!("fleet controller gone, ignoring created app");
        }
    }

    /// Cancel in-flight turns and stop the actor. Enabled records stay
    /// enabled so the next process resumes them.
    pub async fn shutdown(&self) -> Result<(), FleetError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct Entry {
    state: LoopState,
    generation: u64,
    work_started: Option<Instant>,
    rest_started: Option<Instant>,
}

impl Entry {
    fn new(state: LoopState) -> Self {
        Self {
            state,
            generation: 0,
            work_started: None,
            rest_started: None,
        }
    }

    fn take_worked(&mut self) -> Duration {
        self.work_started.take().map(|t| t.elapsed()).unwrap_or_default()
    }
}

struct Actor {
    config: FleetConfig,
    store: Arc<dyn StateStore>,
    submitter: Arc<dyn IterationSubmitter>,
    events: EventBus,
    entries: BTreeMap<String, Entry>,
    tx: mpsc::WeakSender<Command>,
}

impl Actor {
    fn new(
        config: FleetConfig,
        store: Arc<dyn StateStore>,
        submitter: Arc<dyn IterationSubmitter>,
        events: EventBus,
        tx: mpsc::WeakSender<Command>,
    ) -> Self {
        let loaded = store.load().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load fleet state, starting empty");
            LoopStates::new()
        });
        let entries = loaded
            .into_iter()
            .map(|(app_id, state)| (app_id, Entry::new(state)))
            .collect();
        Self {
            config,
            store,
            submitter,
            events,
            entries,
            tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        self.resume();

        let period = self.config.sweep_interval;
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle(cmd) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = sweep.tick() => self.sweep_zombies(),
            }
        }
        info!("fleet controller stopped");
    }

    fn resume(&mut self) {
        let mut resumed = Vec::new();
        for (app_id, entry) in self.entries.iter_mut() {
            if entry.state.restore() {
                entry.rest_started = Some(Instant::now());
                resumed.push(app_id.clone());
            }
        }
        if resumed.is_empty() {
            return;
        }
        info!(count = resumed.len(), "resuming iteration loops");
        for app_id in &resumed {
            self.arm_timer(app_id, self.config.first_delay);
        }
        self.persist();
    }

    /// Apply one command. Returns false once the actor should exit.
    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start { app_id, reply } => {
                let _ = reply.send(self.start(&app_id));
            }
            Command::Stop { app_id, reply } => {
                let _ = reply.send(self.stop(&app_id));
            }
            Command::SetFocus { app_id, focus, reply } => {
                let entry = self.entry_mut(&app_id);
                entry.state.focus_dimension = focus;
                let state = entry.state.clone();
                info!(app_id = %app_id, ?focus, "focus dimension updated");
                self.persist();
                let _ = reply.send(state);
            }
            Command::UpdateDimensions {
                app_id,
                dimensions,
                reply,
            } => {
                let _ = reply.send(self.update_dimensions(&app_id, dimensions));
            }
            Command::Get { app_id, reply } => {
                let _ = reply.send(self.entries.get(&app_id).map(|e| e.state.clone()));
            }
            Command::All { reply } => {
                let _ = reply.send(self.entries.values().map(|e| e.state.clone()).collect());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::StopAll { reply } => {
                let _ = reply.send(self.stop_all());
            }
            Command::AppCreated { app_id } => {
                if self.config.auto_start_on_create {
                    self.send_later(self.config.auto_start_delay, Command::AutoStart { app_id });
                }
            }
            Command::AutoStart { app_id } => match self.start(&app_id) {
                Ok(_) => info!(app_id = %app_id, "iteration loop started for new application"),
                Err(e) => warn!(app_id = %app_id, error = %e, "could not auto-start iteration loop"),
            },
            Command::Tick { app_id, generation } => self.on_tick(&app_id, generation),
            Command::TurnDone {
                app_id,
                task_id,
                result,
            } => self.finish_turn(&app_id, &task_id, result),
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn entry_mut(&mut self, app_id: &str) -> &mut Entry {
        self.entries
            .entry(app_id.to_string())
            .or_insert_with(|| Entry::new(LoopState::new(app_id)))
    }

    fn start(&mut self, app_id: &str) -> Result<LoopState, FleetError> {
        if self.entries.get(app_id).is_some_and(|e| e.state.enabled) {
            return Err(FleetError::AlreadyRunning(app_id.to_string()));
        }
        if !self.submitter.has_app(app_id) {
            return Err(FleetError::UnknownApp(app_id.to_string()));
        }
        let active = self.entries.values().filter(|e| e.state.is_active()).count();
        if active >= self.config.max_concurrent {
            warn!(app_id, active, max = self.config.max_concurrent, "fleet concurrency limit reached");
            return Err(FleetError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            });
        }

        let entry = self.entry_mut(app_id);
        entry.state.enabled = true;
        entry.state.consecutive_errors = 0;
        info!(app_id, iterations = entry.state.iteration_count, "iteration loop started");
        self.events
            .emit(None, Some(app_id), Event::status_line("Iteration loop started"));
        self.begin_turn(app_id);
        Ok(self.snapshot(app_id))
    }

    fn stop(&mut self, app_id: &str) -> Result<LoopState, FleetError> {
        let Some(entry) = self.entries.get_mut(app_id) else {
            return Err(FleetError::UnknownApp(app_id.to_string()));
        };
        let task_id = Self::halt(entry, self.submitter.as_ref());
        info!(app_id, task_id = ?task_id, "iteration loop paused");
        self.events
            .emit(None, Some(app_id), Event::status_line("Iteration loop paused"));
        self.persist();
        Ok(self.snapshot(app_id))
    }

    /// Pause one entry and cancel its turn. Returns the cancelled task id.
    fn halt(entry: &mut Entry, submitter: &dyn IterationSubmitter) -> Option<String> {
        let task_id = entry.state.current_task_id.clone();
        let worked = entry.take_worked();
        entry.state.total_work_time_ms += worked.as_millis() as u64;
        entry.rest_started = None;
        entry.generation += 1;
        entry.state.pause();
        if let Some(task_id) = &task_id
            && !submitter.cancel(task_id)
        {
            debug!(task_id = %task_id, "turn already finished or not cancellable");
        }
        task_id
    }

    fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for entry in self.entries.values_mut() {
            if entry.state.enabled {
                stopped += 1;
            }
            Self::halt(entry, self.submitter.as_ref());
        }
        info!(stopped, "all iteration loops paused");
        self.persist();
        stopped
    }

    fn shutdown(&mut self) {
        for entry in self.entries.values_mut() {
            entry.generation += 1;
            if let Some(task_id) = &entry.state.current_task_id {
                self.submitter.cancel(task_id);
            }
        }
        self.persist();
    }

    fn update_dimensions(&mut self, app_id: &str, mut dimensions: Vec<Dimension>) -> Result<LoopState, FleetError> {
        if dimensions.is_empty() {
            return Err(FleetError::NoDimensions);
        }
        dimensions.sort();
        dimensions.dedup();
        let entry = self.entry_mut(app_id);
        entry.state.enabled_dimensions = dimensions;
        let state = entry.state.clone();
        info!(app_id, dimensions = ?state.enabled_dimensions, "improvement dimensions updated");
        self.persist();
        Ok(state)
    }

    fn stats(&self) -> StationStats {
        let mut stats = StationStats {
            total: self.entries.len(),
            idle: 0,
            working: 0,
            resting: 0,
            paused: 0,
            total_iterations: 0,
            max_concurrent: self.config.max_concurrent,
        };
        for entry in self.entries.values() {
            stats.total_iterations += entry.state.iteration_count;
            match entry.state.status {
                LoopStatus::Idle => stats.idle += 1,
                LoopStatus::Working => stats.working += 1,
                LoopStatus::Resting => stats.resting += 1,
                LoopStatus::Paused => stats.paused += 1,
            }
        }
        stats
    }

    fn on_tick(&mut self, app_id: &str, generation: u64) {
        let Some(entry) = self.entries.get(app_id) else {
            return;
        };
        if entry.generation != generation || !entry.state.enabled || entry.state.status != LoopStatus::Resting {
            debug!(app_id, generation, "stale iteration timer");
            return;
        }
        self.begin_turn(app_id);
    }

    fn begin_turn(&mut self, app_id: &str) {
        let Some(entry) = self.entries.get_mut(app_id) else {
            return;
        };
        if let Some(rested) = entry.rest_started.take() {
            entry.state.total_rest_time_ms += rested.elapsed().as_millis() as u64;
        }
        let iteration = entry.state.iteration_count + 1;
        let task_id = iteration_task_id(app_id);
        let prompt = build_iteration_prompt(
            iteration,
            &entry.state.enabled_dimensions,
            entry.state.focus_dimension,
        );
        entry.state.begin_work(task_id.clone());
        entry.work_started = Some(Instant::now());
        entry.generation += 1;

        info!(app_id, task_id = %task_id, iteration, "iteration started");
        self.events.emit(
            Some(&task_id),
            Some(app_id),
            Event::status_line(format!("Iteration {} started", iteration)),
        );

        let submitter = self.submitter.clone();
        let tx = self.tx.clone();
        let app_id = app_id.to_string();
        tokio::spawn(async move {
            let result = submitter
                .iterate(&app_id, &task_id, prompt)
                .await
                .map_err(|e| e.to_string());
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::TurnDone { app_id, task_id, result }).await;
            }
        });
        self.persist();
    }

    fn finish_turn(&mut self, app_id: &str, task_id: &str, result: Result<String, String>) {
        let Some(entry) = self.entries.get_mut(app_id) else {
            return;
        };
        if entry.state.current_task_id.as_deref() != Some(task_id) {
            debug!(app_id, task_id, "ignoring result of abandoned turn");
            return;
        }
        let worked = entry.take_worked();
        match &result {
            Ok(summary) => {
                entry.state.record_iteration(true, summary.clone());
                info!(app_id, task_id, iteration = entry.state.iteration_count, "iteration complete");
            }
            Err(message) => {
                entry.state.record_iteration(false, message.clone());
                error!(
                    app_id,
                    task_id,
                    consecutive_errors = entry.state.consecutive_errors,
                    error = %message,
                    "iteration failed"
                );
            }
        }
        entry.state.begin_rest(worked);
        entry.rest_started = Some(Instant::now());
        let line = match &result {
            Ok(_) => format!("Iteration {} complete", entry.state.iteration_count),
            Err(e) => format!("Iteration {} failed: {}", entry.state.iteration_count, e),
        };
        self.events.emit(Some(task_id), Some(app_id), Event::status_line(line));
        self.schedule_next(app_id);
    }

    /// Arm the next turn after the rest interval or backoff, or trip the
    /// circuit breaker.
    fn schedule_next(&mut self, app_id: &str) {
        let threshold = self.config.circuit_threshold;
        let rest = self.config.rest_interval;
        let Some(entry) = self.entries.get_mut(app_id) else {
            return;
        };
        if !entry.state.enabled {
            self.persist();
            return;
        }

        let errors = entry.state.consecutive_errors;
        if errors >= threshold {
            entry.generation += 1;
            entry.rest_started = None;
            entry.state.pause();
            error!(app_id, consecutive_errors = errors, "circuit breaker tripped, iteration loop paused");
            self.events.emit(
                None,
                Some(app_id),
                Event::error(format!(
                    "Iteration loop paused after {} consecutive failures; start it again once the app is fixed",
                    errors
                )),
            );
            self.persist();
            return;
        }

        entry.state.status = LoopStatus::Resting;
        let delay = rest.max(backoff_delay(errors));
        if errors > 0 {
            warn!(app_id, consecutive_errors = errors, delay_secs = delay.as_secs(), "backing off");
        }
        self.arm_timer(app_id, delay);
        self.persist();
    }

    fn arm_timer(&mut self, app_id: &str, delay: Duration) {
        let Some(entry) = self.entries.get_mut(app_id) else {
            return;
        };
        entry.generation += 1;
        let generation = entry.generation;
        self.send_later(
            delay,
            Command::Tick {
                app_id: app_id.to_string(),
                generation,
            },
        );
    }

    fn send_later(&self, delay: Duration, cmd: Command) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(cmd).await;
            }
        });
    }

    fn sweep_zombies(&mut self) {
        let timeout = self.config.zombie_timeout;
        let zombies: Vec<(String, Option<String>)> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.state.status == LoopStatus::Working && e.work_started.is_some_and(|t| t.elapsed() > timeout)
            })
            .map(|(app_id, e)| (app_id.clone(), e.state.current_task_id.clone()))
            .collect();

        for (app_id, task_id) in zombies {
            warn!(app_id = %app_id, task_id = ?task_id, "turn exceeded deadline, resetting loop");
            if let Some(task_id) = &task_id {
                self.submitter.cancel(task_id);
            }
            if let Some(entry) = self.entries.get_mut(&app_id) {
                let worked = entry.take_worked();
                entry.state.begin_rest(worked);
                entry.state.consecutive_errors += 1;
                entry.rest_started = Some(Instant::now());
            }
            self.schedule_next(&app_id);
        }
    }

    fn snapshot(&self, app_id: &str) -> LoopState {
        self.entries
            .get(app_id)
            .map(|e| e.state.clone())
            .unwrap_or_else(|| LoopState::new(app_id))
    }

    fn persist(&self) {
        let states: LoopStates = self
            .entries
            .iter()
            .map(|(app_id, e)| (app_id.clone(), e.state.clone()))
            .collect();
        if let Err(e) = self.store.save(&states) {
            warn!(error = %e, "failed to persist fleet state");
        }
    }
}
