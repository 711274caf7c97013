//! Bounded pool of agent processes with per-application binding.
//!
//! Acquisition order: a session already bound to the application, then an
//! idle session (rebinding it), then a fresh process while under the cap,
//! then a FIFO wait list. Released sessions go straight to the head waiter.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{
    AgentEndpoint, AgentSpawner, PoolStatus, SessionInfo, SessionLease, SessionProvider,
    SessionState,
};
use crate::errors::PoolError;
use crate::ports;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_sessions: usize,
    pub base_port: u16,
    pub port_range: u16,
    /// Idle sessions older than this are evicted by the reaper.
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            base_port: 8090,
            port_range: 50,
            idle_timeout: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(3600),
        }
    }
}

impl PoolConfig {
    pub fn port_span(&self) -> (u16, u16) {
        let end = self
            .base_port
            .saturating_add(self.port_range.saturating_sub(1));
        (self.base_port, end)
    }
}

struct AgentSession {
    port: u16,
    generation: u64,
    bound_app: Option<String>,
    leases: usize,
    use_count: u64,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    kill: CancellationToken,
}

impl AgentSession {
    fn state(&self) -> SessionState {
        if self.leases > 0 {
            SessionState::Busy
        } else {
            SessionState::Idle
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
        self.last_used_at = Utc::now();
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            port: self.port,
            app_id: self.bound_app.clone(),
            status: self.state(),
            use_count: self.use_count,
            last_used_at: self.last_used_at,
            created_at: self.created_at,
        }
    }
}

/// What a waiter is handed when capacity frees up.
enum Grant {
    /// An existing session, already bound to the waiter's application.
    Bound(u16),
    /// A reserved port the waiter must spawn on itself.
    Spawn(u16),
}

struct Waiter {
    id: u64,
    app_id: String,
    tx: oneshot::Sender<Result<Grant, PoolError>>,
}

#[derive(Default)]
struct PoolState {
    sessions: BTreeMap<u16, AgentSession>,
    by_app: HashMap<String, u16>,
    starting: HashSet<u16>,
    waiters: VecDeque<Waiter>,
    next_id: u64,
    closed: bool,
}

impl PoolState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn bind_existing(&mut self, app_id: &str) -> Option<u16> {
        let port = *self.by_app.get(app_id)?;
        let session = self.sessions.get_mut(&port)?;
        session.leases += 1;
        session.use_count += 1;
        session.touch();
        Some(port)
    }

    /// Bind an idle session, preferring unbound ones, then the least recently used.
    fn bind_idle(&mut self, app_id: &str) -> Option<u16> {
        let port = self
            .sessions
            .values()
            .filter(|s| s.leases == 0)
            .min_by_key(|s| (s.bound_app.is_some(), s.last_used))
            .map(|s| s.port)?;

        let session = self.sessions.get_mut(&port)?;
        if let Some(previous) = session.bound_app.replace(app_id.to_string()) {
            self.by_app.remove(&previous);
        }
        session.leases = 1;
        session.use_count += 1;
        session.touch();
        self.by_app.insert(app_id.to_string(), port);
        Some(port)
    }

    fn unbind(&mut self, port: u16) -> Option<AgentSession> {
        let session = self.sessions.remove(&port)?;
        if let Some(app) = &session.bound_app
            && self.by_app.get(app) == Some(&port)
        {
            self.by_app.remove(app);
        }
        Some(session)
    }

    fn occupancy(&self) -> usize {
        self.sessions.len() + self.starting.len()
    }
}

struct PoolShared {
    config: PoolConfig,
    spawner: Arc<dyn AgentSpawner>,
    state: Mutex<PoolState>,
    shutdown: CancellationToken,
}

/// A queued acquire. Dropped unclaimed, it leaves the wait list and hands
/// back whatever it was granted.
struct WaitTicket<'a> {
    pool: &'a PoolShared,
    id: u64,
    rx: oneshot::Receiver<Result<Grant, PoolError>>,
    claimed: bool,
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        if !self.claimed {
            self.pool.abandon_wait(self.id, &mut self.rx);
        }
    }
}

/// A port held in `starting` while its process spawns.
struct Reservation<'a> {
    pool: &'a PoolShared,
    port: u16,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.lock();
            state.starting.remove(&self.port);
            self.pool.serve_waiters(&mut state);
        }
    }
}

enum Decision {
    Ready(u16),
    Spawn(u16),
    Wait(u64, oneshot::Receiver<Result<Grant, PoolError>>),
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reserve_port(&self, state: &mut PoolState) -> Result<u16, PoolError> {
        let (start, end) = self.config.port_span();
        let held: HashSet<u16> = state
            .sessions
            .keys()
            .chain(state.starting.iter())
            .copied()
            .collect();
        let port = ports::find_free_port(start, end, &held)
            .ok_or(PoolError::NoFreePort { start, end })?;
        state.starting.insert(port);
        Ok(port)
    }

    async fn acquire(self: &Arc<Self>, app_id: &str, timeout: Duration) -> Result<SessionLease, PoolError> {
        let decision = {
            let mut state = self.lock();
            if state.closed {
                return Err(PoolError::ShuttingDown);
            }
            if let Some(port) = state.bind_existing(app_id) {
                Decision::Ready(port)
            } else if let Some(port) = state.bind_idle(app_id) {
                Decision::Ready(port)
            } else if state.occupancy() < self.config.max_sessions {
                Decision::Spawn(self.reserve_port(&mut state)?)
            } else {
                let (tx, rx) = oneshot::channel();
                let id = state.next_id();
                state.waiters.push_back(Waiter {
                    id,
                    app_id: app_id.to_string(),
                    tx,
                });
                info!(app_id, waiting = state.waiters.len(), "agent pool full, queued for a session");
                Decision::Wait(id, rx)
            }
        };

        match decision {
            Decision::Ready(port) => Ok(self.lease(port, app_id)),
            Decision::Spawn(port) => self.spawn_bound(port, app_id).await,
            Decision::Wait(id, rx) => {
                let mut ticket = WaitTicket {
                    pool: self,
                    id,
                    rx,
                    claimed: false,
                };
                let granted = match tokio::time::timeout(timeout, &mut ticket.rx).await {
                    Ok(Ok(granted)) => granted,
                    Ok(Err(_)) => return Err(PoolError::ShuttingDown),
                    Err(_) => {
                        let mut state = self.lock();
                        if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                            state.waiters.remove(pos);
                            return Err(PoolError::AcquireTimeout {
                                app_id: app_id.to_string(),
                                waited: timeout,
                            });
                        }
                        drop(state);
                        // Served between the deadline and taking the lock
                        ticket.rx.try_recv().map_err(|_| PoolError::AcquireTimeout {
                            app_id: app_id.to_string(),
                            waited: timeout,
                        })?
                    }
                };
                ticket.claimed = true;
                match granted? {
                    Grant::Bound(port) => Ok(self.lease(port, app_id)),
                    Grant::Spawn(port) => self.spawn_bound(port, app_id).await,
                }
            }
        }
    }

    async fn spawn_bound(self: &Arc<Self>, port: u16, app_id: &str) -> Result<SessionLease, PoolError> {
        let mut reservation = Reservation {
            pool: self,
            port,
            armed: true,
        };
        let spawned = self.spawner.spawn(port).await;
        reservation.armed = false;
        let process = match spawned {
            Ok(process) => process,
            Err(e) => {
                error!(port, app_id, error = %e, "failed to start agent session");
                let mut state = self.lock();
                state.starting.remove(&port);
                self.serve_waiters(&mut state);
                return Err(e);
            }
        };

        let mut state = self.lock();
        state.starting.remove(&port);
        if state.closed {
            process.kill.cancel();
            return Err(PoolError::ShuttingDown);
        }

        let generation = state.next_id();
        if let Some(previous) = state.by_app.insert(app_id.to_string(), port)
            && let Some(session) = state.sessions.get_mut(&previous)
        {
            session.bound_app = None;
        }
        let now = Utc::now();
        state.sessions.insert(
            port,
            AgentSession {
                port,
                generation,
                bound_app: Some(app_id.to_string()),
                leases: 1,
                use_count: 1,
                last_used: Instant::now(),
                last_used_at: now,
                created_at: now,
                kill: process.kill,
            },
        );
        drop(state);
        info!(port, app_id, pid = process.pid, "agent session started");

        let weak = Arc::downgrade(self);
        let exited = process.exited;
        tokio::spawn(async move {
            let _ = exited.await;
            if let Some(shared) = weak.upgrade() {
                shared.on_process_exit(port, generation);
            }
        });

        Ok(self.lease(port, app_id))
    }

    fn lease(self: &Arc<Self>, port: u16, app_id: &str) -> SessionLease {
        let weak: Weak<Self> = Arc::downgrade(self);
        SessionLease::new(AgentEndpoint::local(port), app_id, move || {
            if let Some(shared) = weak.upgrade() {
                shared.release(port);
            }
        })
    }

    fn release(&self, port: u16) {
        let mut state = self.lock();
        if let Some(session) = state.sessions.get_mut(&port) {
            session.leases = session.leases.saturating_sub(1);
            session.touch();
        }
        self.serve_waiters(&mut state);
    }

    /// Hand idle sessions or free capacity to waiters, oldest first.
    fn serve_waiters(&self, state: &mut PoolState) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            let grant = if let Some(port) = state.bind_existing(&waiter.app_id) {
                Grant::Bound(port)
            } else if let Some(port) = state.bind_idle(&waiter.app_id) {
                Grant::Bound(port)
            } else if state.occupancy() < self.config.max_sessions {
                match self.reserve_port(state) {
                    Ok(port) => Grant::Spawn(port),
                    Err(e) => {
                        let _ = waiter.tx.send(Err(e));
                        continue;
                    }
                }
            } else {
                state.waiters.push_front(waiter);
                return;
            };

            if let Err(Ok(unclaimed)) = waiter.tx.send(Ok(grant)) {
                match unclaimed {
                    Grant::Bound(port) => {
                        if let Some(session) = state.sessions.get_mut(&port) {
                            session.leases = session.leases.saturating_sub(1);
                        }
                    }
                    Grant::Spawn(port) => {
                        state.starting.remove(&port);
                    }
                }
            }
        }
    }

    /// Undo a wait whose acquiring future was dropped, returning anything
    /// it was already granted.
    fn abandon_wait(&self, id: u64, rx: &mut oneshot::Receiver<Result<Grant, PoolError>>) {
        let mut state = self.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
            state.waiters.remove(pos);
            return;
        }
        rx.close();
        match rx.try_recv() {
            Ok(Ok(Grant::Bound(port))) => {
                if let Some(session) = state.sessions.get_mut(&port) {
                    session.leases = session.leases.saturating_sub(1);
                    session.touch();
                }
            }
            Ok(Ok(Grant::Spawn(port))) => {
                state.starting.remove(&port);
            }
            _ => return,
        }
        self.serve_waiters(&mut state);
    }

    fn on_process_exit(&self, port: u16, generation: u64) {
        let mut state = self.lock();
        if state.sessions.get(&port).map(|s| s.generation) != Some(generation) {
            return;
        }
        if let Some(session) = state.unbind(port) {
            warn!(
                port,
                app_id = session.bound_app.as_deref().unwrap_or("-"),
                "agent process exited, session removed"
            );
        }
        self.serve_waiters(&mut state);
    }

    fn reap_idle(&self) -> usize {
        let mut state = self.lock();
        let expired: Vec<u16> = state
            .sessions
            .values()
            .filter(|s| s.leases == 0 && s.last_used.elapsed() >= self.config.idle_timeout)
            .map(|s| s.port)
            .collect();
        for port in &expired {
            if let Some(session) = state.unbind(*port) {
                info!(port, app_id = session.bound_app.as_deref().unwrap_or("-"), "evicting idle agent session");
                session.kill.cancel();
            }
        }
        if !expired.is_empty() {
            self.serve_waiters(&mut state);
        }
        expired.len()
    }

    fn status(&self) -> PoolStatus {
        let state = self.lock();
        let sessions: Vec<SessionInfo> = state.sessions.values().map(|s| s.info()).collect();
        PoolStatus {
            mode: "pool",
            total: sessions.len(),
            idle: sessions.iter().filter(|s| s.status == SessionState::Idle).count(),
            busy: sessions.iter().filter(|s| s.status == SessionState::Busy).count(),
            starting: state.starting.len(),
            max: self.config.max_sessions,
            waiting: state.waiters.len(),
            sessions,
        }
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        state.closed = true;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(PoolError::ShuttingDown));
        }
        let ports: Vec<u16> = state.sessions.keys().copied().collect();
        for port in ports {
            if let Some(session) = state.unbind(port) {
                session.kill.cancel();
            }
        }
        self.shutdown.cancel();
        info!("agent session pool shut down");
    }
}

/// Pool of up to `max_sessions` agent processes.
#[derive(Clone)]
pub struct SessionPool {
    shared: Arc<PoolShared>,
}

impl SessionPool {
    pub fn new(config: PoolConfig, spawner: Arc<dyn AgentSpawner>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                spawner,
                state: Mutex::new(PoolState::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Evict idle sessions past the idle timeout. Returns how many were evicted.
    pub fn reap_idle(&self) -> usize {
        self.shared.reap_idle()
    }

    /// Run [`Self::reap_idle`] every `reap_interval` until shutdown.
    pub fn start_reaper(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let shutdown = self.shared.shutdown.clone();
        let period = self.shared.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(shared) = weak.upgrade() else { break };
                        let evicted = shared.reap_idle();
                        if evicted > 0 {
                            info!(evicted, "reaped idle agent sessions");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl SessionProvider for SessionPool {
    async fn acquire(&self, app_id: &str, timeout: Duration) -> Result<SessionLease, PoolError> {
        self.shared.acquire(app_id, timeout).await
    }

    fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    async fn shutdown(&self) {
        self.shared.shutdown();
    }
}
