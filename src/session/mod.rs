//! Agent session management.
//!
//! A session is a leased handle to one external coding-agent process. Two
//! providers exist:
//!
//! | Provider        | Behaviour                                                  |
//! |-----------------|------------------------------------------------------------|
//! | `SessionPool`   | up to N agent processes, bound per application, FIFO wait |
//! | `SingleSession` | one shared agent, in-flight counted, rebuilt when stale    |
//!
//! Both hand out a [`SessionLease`] that releases its binding when dropped,
//! so every exit path of a turn gives the session back.

pub mod pool;
pub mod single;
pub mod spawner;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::PoolError;

pub use pool::{PoolConfig, SessionPool};
pub use single::{SingleSession, SingleSessionConfig};
pub use spawner::{AgentProcess, AgentSpawner, CommandSpawner, SpawnConfig};

/// Where the RPC channel for a session connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentEndpoint {
    pub port: u16,
    pub url: String,
}

impl AgentEndpoint {
    pub fn local(port: u16) -> Self {
        Self {
            port,
            url: format!("ws://127.0.0.1:{}/acp", port),
        }
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

/// A bound session. Dropping the lease releases it.
pub struct SessionLease {
    endpoint: AgentEndpoint,
    app_id: String,
    release: Option<ReleaseFn>,
}

impl SessionLease {
    pub fn new(
        endpoint: AgentEndpoint,
        app_id: impl Into<String>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            endpoint,
            app_id: app_id.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn endpoint(&self) -> &AgentEndpoint {
        &self.endpoint
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("endpoint", &self.endpoint)
            .field("app_id", &self.app_id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Busy,
    Starting,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub port: u16,
    pub app_id: Option<String>,
    pub status: SessionState,
    pub use_count: u64,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub mode: &'static str,
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub starting: usize,
    pub max: usize,
    pub waiting: usize,
    pub sessions: Vec<SessionInfo>,
}

/// Source of agent sessions for the deployment pipeline.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Get a session bound to `app_id`, waiting at most `timeout`.
    async fn acquire(&self, app_id: &str, timeout: Duration) -> Result<SessionLease, PoolError>;

    fn status(&self) -> PoolStatus;

    /// Reject waiters and stop every agent process.
    async fn shutdown(&self);
}
