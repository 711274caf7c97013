//! Generated applications: metadata, registry, process control, listing.

pub mod metadata;
pub mod registry;
pub mod runner;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

pub use metadata::{AppMetadata, IdeaHistoryEntry};
pub use registry::{AppRegistry, FailureRecord, MemoryRegistry, PendingApp, is_ignored_dir_name};
pub use runner::{AppRunner, ProcessRunner, RunState, RunnerConfig, RunningApp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Stopped,
    Starting,
    Running,
    /// Placeholder for an identity whose first deployment is in flight.
    Creating,
}

impl From<RunState> for AppStatus {
    fn from(state: RunState) -> Self {
        match state {
            RunState::Starting => AppStatus::Starting,
            RunState::Running => AppStatus::Running,
        }
    }
}

/// One row of `list_applications`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSummary {
    pub app_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub app_type: String,
    pub status: AppStatus,
    pub port: Option<u16>,
    pub idea_identity: Option<String>,
    pub history: Vec<IdeaHistoryEntry>,
    pub last_revision: Option<u32>,
    pub last_output_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<FailureRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl AppSummary {
    fn from_metadata(app_id: String, dir: PathBuf, meta: Option<AppMetadata>) -> Self {
        let meta = meta.unwrap_or_else(|| AppMetadata {
            idea_key: None,
            port: None,
            ..AppMetadata::new(app_id.clone(), "", 0)
        });
        Self {
            app_id,
            name: meta.name,
            app_type: meta.app_type,
            status: AppStatus::Stopped,
            port: meta.port,
            idea_identity: meta.idea_key,
            history: meta.idea_history,
            last_revision: meta.last_revision,
            last_output_at: meta.last_output_at,
            started_at: None,
            created_at: Some(meta.created_at),
            last_error: None,
            path: Some(dir),
        }
    }

    fn from_pending(pending: PendingApp, last_error: Option<FailureRecord>) -> Self {
        Self {
            app_id: pending.id,
            name: pending.name,
            app_type: "pending".to_string(),
            status: AppStatus::Creating,
            port: None,
            idea_identity: Some(pending.idea_key),
            history: vec![IdeaHistoryEntry {
                revision: None,
                timestamp: pending.created_at,
                text: pending.idea_text,
                assistant_preview: None,
            }],
            last_revision: None,
            last_output_at: None,
            started_at: None,
            created_at: Some(pending.created_at),
            last_error,
            path: None,
        }
    }
}

/// Whether `app_id` can name a directory directly under the apps root.
pub fn is_valid_app_id(app_id: &str) -> bool {
    !app_id.is_empty()
        && !app_id.contains(['/', '\\'])
        && !is_ignored_dir_name(app_id)
}

/// All applications on disk plus in-flight placeholders, newest first.
pub fn list_applications(
    apps_dir: &Path,
    registry: &dyn AppRegistry,
    runner: &dyn AppRunner,
) -> Vec<AppSummary> {
    let mut apps = Vec::new();
    if let Ok(entries) = std::fs::read_dir(apps_dir) {
        for entry in entries.flatten() {
            let app_id = entry.file_name().to_string_lossy().into_owned();
            let dir = entry.path();
            if is_ignored_dir_name(&app_id) || !dir.is_dir() {
                continue;
            }
            let meta = AppMetadata::load(&dir).unwrap_or_else(|e| {
                warn!(app_id = %app_id, error = %e, "unreadable metadata, listing with defaults");
                None
            });
            let mut summary = AppSummary::from_metadata(app_id, dir, meta);
            if let Some(running) = runner.status(&summary.app_id) {
                summary.status = running.status.into();
                summary.port = Some(running.port);
                summary.started_at = Some(running.started_at);
            }
            summary.last_error = summary
                .idea_identity
                .as_deref()
                .and_then(|key| registry.last_failure(key));
            apps.push(summary);
        }
    }

    for pending in registry.pending() {
        let failure = registry.last_failure(&pending.idea_key);
        apps.push(AppSummary::from_pending(pending, failure));
    }

    apps.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    apps
}
