//! Single shared agent connection, used when pooling is disabled.
//!
//! Every application shares one agent process. The connection counts tasks
//! in flight, refuses a non-forced teardown while any are running, and is
//! treated as unhealthy once unused past the idle window; an unhealthy
//! connection is silently rebuilt by the next acquire.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    AgentEndpoint, AgentSpawner, PoolStatus, SessionInfo, SessionLease, SessionProvider,
    SessionState,
};
use crate::errors::PoolError;
use crate::ports;

#[derive(Debug, Clone)]
pub struct SingleSessionConfig {
    pub base_port: u16,
    pub port_range: u16,
    pub idle_window: Duration,
}

impl Default for SingleSessionConfig {
    fn default() -> Self {
        Self {
            base_port: 8090,
            port_range: 50,
            idle_window: Duration::from_secs(15 * 60),
        }
    }
}

struct LiveAgent {
    port: u16,
    kill: CancellationToken,
    alive: Arc<AtomicBool>,
    created_at: DateTime<Utc>,
}

struct Activity {
    at: Instant,
    at_utc: DateTime<Utc>,
    use_count: u64,
}

struct SingleShared {
    config: SingleSessionConfig,
    spawner: Arc<dyn AgentSpawner>,
    in_flight: AtomicUsize,
    activity: Mutex<Activity>,
    agent: tokio::sync::Mutex<Option<LiveAgent>>,
}

impl SingleShared {
    fn touch(&self, used: bool) {
        let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
        activity.at = Instant::now();
        activity.at_utc = Utc::now();
        if used {
            activity.use_count += 1;
        }
    }

    fn idle_for(&self) -> Duration {
        self.activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .at
            .elapsed()
    }

    fn is_healthy(&self, agent: &LiveAgent) -> bool {
        agent.alive.load(Ordering::SeqCst)
            && (self.in_flight.load(Ordering::SeqCst) > 0
                || self.idle_for() <= self.config.idle_window)
    }

    async fn checkout(self: &Arc<Self>, app_id: &str) -> Result<SessionLease, PoolError> {
        let mut agent = self.agent.lock().await;

        let healthy = agent.as_ref().is_some_and(|a| self.is_healthy(a));
        if !healthy {
            if let Some(stale) = agent.take() {
                info!(port = stale.port, "rebuilding stale agent connection");
                stale.kill.cancel();
            }
            *agent = Some(self.start_agent().await?);
        }

        let port = agent.as_ref().map(|a| a.port).ok_or(PoolError::ShuttingDown)?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch(true);

        let weak = Arc::downgrade(self);
        Ok(SessionLease::new(AgentEndpoint::local(port), app_id, move || {
            if let Some(shared) = weak.upgrade() {
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                shared.touch(false);
            }
        }))
    }

    async fn start_agent(&self) -> Result<LiveAgent, PoolError> {
        let start = self.config.base_port;
        let end = start.saturating_add(self.config.port_range.saturating_sub(1));
        let port = ports::find_free_port(start, end, &HashSet::new())
            .ok_or(PoolError::NoFreePort { start, end })?;

        let process = self.spawner.spawn(port).await?;
        let alive = Arc::new(AtomicBool::new(true));
        let flag = alive.clone();
        let exited = process.exited;
        tokio::spawn(async move {
            let _ = exited.await;
            flag.store(false, Ordering::SeqCst);
            warn!(port, "shared agent process exited");
        });

        Ok(LiveAgent {
            port,
            kill: process.kill,
            alive,
            created_at: Utc::now(),
        })
    }
}

#[derive(Clone)]
pub struct SingleSession {
    shared: Arc<SingleShared>,
}

impl SingleSession {
    pub fn new(config: SingleSessionConfig, spawner: Arc<dyn AgentSpawner>) -> Self {
        Self {
            shared: Arc::new(SingleShared {
                config,
                spawner,
                in_flight: AtomicUsize::new(0),
                activity: Mutex::new(Activity {
                    at: Instant::now(),
                    at_utc: Utc::now(),
                    use_count: 0,
                }),
                agent: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub async fn is_healthy(&self) -> bool {
        let agent = self.shared.agent.lock().await;
        agent.as_ref().is_some_and(|a| self.shared.is_healthy(a))
    }

    /// Tear the connection down. Refused while tasks are in flight unless forced.
    pub async fn disconnect(&self, force: bool) -> Result<(), PoolError> {
        let in_flight = self.in_flight();
        if in_flight > 0 && !force {
            return Err(PoolError::Busy { in_flight });
        }
        if let Some(agent) = self.shared.agent.lock().await.take() {
            info!(port = agent.port, force, "disconnecting shared agent");
            agent.kill.cancel();
        }
        Ok(())
    }

    pub async fn reset(&self) {
        let _ = self.disconnect(true).await;
    }
}

#[async_trait]
impl SessionProvider for SingleSession {
    async fn acquire(&self, app_id: &str, timeout: Duration) -> Result<SessionLease, PoolError> {
        tokio::time::timeout(timeout, self.shared.checkout(app_id))
            .await
            .map_err(|_| PoolError::AcquireTimeout {
                app_id: app_id.to_string(),
                waited: timeout,
            })?
    }

    fn status(&self) -> PoolStatus {
        let in_flight = self.in_flight();
        let (use_count, last_used_at) = {
            let activity = self.shared.activity.lock().unwrap_or_else(|e| e.into_inner());
            (activity.use_count, activity.at_utc)
        };
        let (sessions, starting) = match self.shared.agent.try_lock() {
            Ok(agent) => (
                agent
                    .as_ref()
                    .map(|a| SessionInfo {
                        port: a.port,
                        app_id: None,
                        status: if in_flight > 0 {
                            SessionState::Busy
                        } else {
                            SessionState::Idle
                        },
                        use_count,
                        last_used_at,
                        created_at: a.created_at,
                    })
                    .into_iter()
                    .collect::<Vec<_>>(),
                0,
            ),
            // Locked while a checkout is (re)building the agent
            Err(_) => (Vec::new(), 1),
        };
        PoolStatus {
            mode: "single",
            total: sessions.len(),
            idle: usize::from(in_flight == 0 && !sessions.is_empty()),
            busy: usize::from(in_flight > 0 && !sessions.is_empty()),
            starting,
            max: 1,
            waiting: 0,
            sessions,
        }
    }

    async fn shutdown(&self) {
        self.reset().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pool::tests::FakeSpawner;

    fn single(idle_window: Duration, base_port: u16) -> (SingleSession, Arc<FakeSpawner>) {
        let spawner = Arc::new(FakeSpawner::default());
        let session = SingleSession::new(
            SingleSessionConfig {
                base_port,
                port_range: 20,
                idle_window,
            },
            spawner.clone(),
        );
        (session, spawner)
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_leases_share_one_agent_and_count_in_flight() {
        let (single, spawner) = single(Duration::from_secs(900), 47300);
        let a = single.acquire("app_a", WAIT).await.unwrap();
        let b = single.acquire("app_b", WAIT).await.unwrap();
        assert_eq!(a.endpoint().port, b.endpoint().port);
        assert_eq!(single.in_flight(), 2);
        assert_eq!(spawner.spawned(), 1);

        drop(a);
        drop(b);
        assert_eq!(single.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_refused_while_busy() {
        let (single, spawner) = single(Duration::from_secs(900), 47320);
        let lease = single.acquire("app_a", WAIT).await.unwrap();
        let port = lease.endpoint().port;

        let err = single.disconnect(false).await.unwrap_err();
        assert!(matches!(err, PoolError::Busy { in_flight: 1 }));
        assert!(!spawner.was_killed(port));

        drop(lease);
        single.disconnect(false).await.unwrap();
        assert!(spawner.was_killed(port));
    }

    #[tokio::test]
    async fn test_stale_connection_rebuilt_on_next_use() {
        let (single, spawner) = single(Duration::ZERO, 47340);
        drop(single.acquire("app_a", WAIT).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!single.is_healthy().await);

        let lease = single.acquire("app_a", WAIT).await.unwrap();
        assert_eq!(spawner.spawned(), 2);
        assert_eq!(single.status().busy, 1);
        drop(lease);
    }

    #[tokio::test]
    async fn test_exited_agent_rebuilt() {
        let (single, spawner) = single(Duration::from_secs(900), 47360);
        let lease = single.acquire("app_a", WAIT).await.unwrap();
        let port = lease.endpoint().port;
        drop(lease);

        spawner.crash(port);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!single.is_healthy().await);
        let _lease = single.acquire("app_a", WAIT).await.unwrap();
        assert_eq!(spawner.spawned(), 2);
    }
}
