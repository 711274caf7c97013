//! Typed error hierarchy for the ideaforge orchestrator.
//!
//! One enum per subsystem:
//! - `SubmitError`: queue admission rejections
//! - `PoolError`: agent session acquisition and process management
//! - `RpcError`: agent protocol failures during a turn
//! - `PromoteError`: staging → live directory promotion
//! - `AppError`: generated-application process control
//! - `PipelineError`: one deployment attempt, wrapping the above
//! - `FleetError`: iteration loop control operations

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::queue::Retryable;

/// Rejections returned synchronously by `TaskQueue::submit`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Idea '{identity}' already has task {task_id} in flight")]
    DuplicateInFlight { identity: String, task_id: String },

    #[error("Idea identity must not be empty")]
    EmptyIdentity,
}

/// Errors from the agent session pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Timed out after {waited:?} waiting for an agent session for app {app_id}")]
    AcquireTimeout { app_id: String, waited: Duration },

    #[error("No free agent port in {start}..={end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Agent on port {port} not ready after {waited:?}")]
    NotReady { port: u16, waited: Duration },

    #[error("Agent session pool is shutting down")]
    ShuttingDown,

    #[error("Agent connection busy with {in_flight} task(s)")]
    Busy { in_flight: usize },
}

/// Errors from driving one agent turn.
///
/// Display strings start with a stable code so persisted error text can be
/// matched later.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("AGENT_CONNECT_TIMEOUT: no connection after {0:?}")]
    ConnectTimeout(Duration),

    #[error("AGENT_SEND_TIMEOUT: prompt not accepted after {0:?}")]
    SendTimeout(Duration),

    #[error("AGENT_IDLE_TIMEOUT: no agent message for {0:?}")]
    IdleTimeout(Duration),

    #[error("AGENT_OVERALL_TIMEOUT: turn exceeded {0:?}")]
    OverallTimeout(Duration),

    #[error("AGENT_TOOL_APPROVAL_REQUIRED: tool call {call_id} ({kind}) needs manual approval")]
    ApprovalRequired { call_id: String, kind: String },

    #[error("Agent channel closed before the turn finished")]
    ChannelClosed,

    #[error("Agent transport error: {0}")]
    Transport(String),

    #[error("Malformed agent message: {0}")]
    Protocol(String),

    #[error("Agent reported an error: {0}")]
    Agent(String),

    #[error("Turn cancelled")]
    Cancelled,
}

impl RpcError {
    /// Protocol-level failures after which retrying the same task only burns
    /// another full agent turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectTimeout(_)
                | RpcError::SendTimeout(_)
                | RpcError::IdleTimeout(_)
                | RpcError::OverallTimeout(_)
                | RpcError::ApprovalRequired { .. }
                | RpcError::Cancelled
        )
    }
}

/// Errors from promoting a staged tree to the live application directory.
#[derive(Debug, Error)]
pub enum PromoteError {
    #[error("Staging directory {0} does not exist")]
    StagingMissing(PathBuf),

    #[error("Promotion failed while trying to {phase}: {source}")]
    Swap {
        phase: &'static str,
        #[source]
        source: std::io::Error,
        /// Whether the staged tree is still on disk for inspection.
        staging_preserved: bool,
    },
}

/// Errors from generated-application process control.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Application {0} not found")]
    NotFound(String),

    #[error("No free application port in {start}..={end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Failed to start application {app_id}: {source}")]
    Spawn {
        app_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read metadata for {app_id}: {source}")]
    Metadata {
        app_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Application {app_id} did not stop within {waited:?}")]
    StopTimeout { app_id: String, waited: Duration },
}

/// Errors from a single deployment attempt.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Session(#[from] PoolError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Staged output is missing required files: {}", missing.join(", "))]
    Validation { missing: Vec<String> },

    #[error(transparent)]
    Promotion(#[from] PromoteError),

    #[error(transparent)]
    App(#[from] AppError),

    #[error("Filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Task {0} was cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

impl Retryable for PipelineError {
    fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Rpc(e) => !e.is_terminal(),
            PipelineError::Cancelled(_) => false,
            _ => true,
        }
    }
}

/// Errors from fleet control operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FleetError {
    #[error("Iteration loop already running for {0}")]
    AlreadyRunning(String),

    #[error("Concurrency limit reached ({max} apps iterating)")]
    ConcurrencyLimit { max: usize },

    #[error("Application {0} not found")]
    UnknownApp(String),

    #[error("At least one improvement dimension must stay enabled")]
    NoDimensions,

    #[error("Fleet controller is not running")]
    ControllerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_error_duplicate_carries_task() {
        let err = SubmitError::DuplicateInFlight {
            identity: "a.txt".to_string(),
            task_id: "task_1".to_string(),
        };
        assert!(err.to_string().contains("a.txt"));
        assert!(err.to_string().contains("task_1"));
    }

    #[test]
    fn test_rpc_error_codes_in_display() {
        let err = RpcError::IdleTimeout(Duration::from_secs(30));
        assert!(err.to_string().starts_with("AGENT_IDLE_TIMEOUT"));
        let err = RpcError::ApprovalRequired {
            call_id: "c1".to_string(),
            kind: "execute".to_string(),
        };
        assert!(err.to_string().starts_with("AGENT_TOOL_APPROVAL_REQUIRED"));
    }

    #[test]
    fn test_rpc_timeouts_are_terminal() {
        assert!(RpcError::ConnectTimeout(Duration::from_secs(1)).is_terminal());
        assert!(RpcError::SendTimeout(Duration::from_secs(1)).is_terminal());
        assert!(RpcError::IdleTimeout(Duration::from_secs(1)).is_terminal());
        assert!(RpcError::OverallTimeout(Duration::from_secs(1)).is_terminal());
        assert!(!RpcError::ChannelClosed.is_terminal());
        assert!(!RpcError::Transport("reset".to_string()).is_terminal());
    }

    #[test]
    fn test_pipeline_error_retry_classification() {
        let timeout: PipelineError = RpcError::OverallTimeout(Duration::from_secs(300)).into();
        assert!(!timeout.is_retryable());

        let validation = PipelineError::Validation {
            missing: vec!["server.js".to_string()],
        };
        assert!(validation.is_retryable());

        let closed: PipelineError = RpcError::ChannelClosed.into();
        assert!(closed.is_retryable());

        assert!(!PipelineError::Cancelled("task_1".to_string()).is_retryable());
    }

    #[test]
    fn test_validation_error_lists_missing_files() {
        let err = PipelineError::Validation {
            missing: vec!["server.js".to_string(), "public/app.js".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Staged output is missing required files: server.js, public/app.js"
        );
    }

    #[test]
    fn test_pipeline_error_converts_from_pool_error() {
        let inner = PoolError::AcquireTimeout {
            app_id: "app_1".to_string(),
            waited: Duration::from_secs(60),
        };
        let err: PipelineError = inner.into();
        match &err {
            PipelineError::Session(PoolError::AcquireTimeout { app_id, .. }) => {
                assert_eq!(app_id, "app_1");
            }
            _ => panic!("Expected PipelineError::Session(AcquireTimeout)"),
        }
    }

    #[test]
    fn test_promote_error_reports_phase() {
        let err = PromoteError::Swap {
            phase: "rename staging to live",
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            staging_preserved: true,
        };
        assert!(err.to_string().contains("rename staging to live"));
    }
}
