//! Persisted per-application iteration loop record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dimensions::Dimension;

pub const MAX_LOOP_HISTORY: usize = 50;

const BACKOFF_BASE: Duration = Duration::from_secs(30);
const BACKOFF_CAP: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    #[default]
    Idle,
    Working,
    Resting,
    Paused,
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopStatus::Idle => "idle",
            LoopStatus::Working => "working",
            LoopStatus::Resting => "resting",
            LoopStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration: u64,
    pub timestamp: DateTime<Utc>,
    pub focus: Option<Dimension>,
    pub dimensions: Vec<Dimension>,
    pub success: bool,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopState {
    pub app_id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub status: LoopStatus,
    #[serde(default)]
    pub iteration_count: u64,
    #[serde(default)]
    pub focus_dimension: Option<Dimension>,
    #[serde(default = "all_dimensions")]
    pub enabled_dimensions: Vec<Dimension>,
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub total_work_time_ms: u64,
    #[serde(default)]
    pub total_rest_time_ms: u64,
    #[serde(default)]
    pub last_work_start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_iterate_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<IterationRecord>,
}

fn all_dimensions() -> Vec<Dimension> {
    Dimension::ALL.to_vec()
}

impl LoopState {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            enabled: false,
            status: LoopStatus::Idle,
            iteration_count: 0,
            focus_dimension: None,
            enabled_dimensions: all_dimensions(),
            consecutive_errors: 0,
            current_task_id: None,
            total_work_time_ms: 0,
            total_rest_time_ms: 0,
            last_work_start_at: None,
            last_iterate_at: None,
            created_at: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Counts toward the fleet concurrency cap.
    pub fn is_active(&self) -> bool {
        self.enabled && matches!(self.status, LoopStatus::Working | LoopStatus::Resting)
    }

    pub fn begin_work(&mut self, task_id: String) {
        self.status = LoopStatus::Working;
        self.current_task_id = Some(task_id);
        self.last_work_start_at = Some(Utc::now());
    }

    /// Leave `Working`, crediting `worked` to the work total.
    pub fn begin_rest(&mut self, worked: Duration) {
        self.total_work_time_ms += worked.as_millis() as u64;
        self.current_task_id = None;
        self.last_work_start_at = None;
        self.status = LoopStatus::Resting;
    }

    pub fn record_iteration(&mut self, success: bool, summary: impl Into<String>) {
        self.iteration_count += 1;
        let now = Utc::now();
        self.last_iterate_at = Some(now);
        self.history.push(IterationRecord {
            iteration: self.iteration_count,
            timestamp: now,
            focus: self.focus_dimension,
            dimensions: self.enabled_dimensions.clone(),
            success,
            summary: summary.into(),
        });
        if self.history.len() > MAX_LOOP_HISTORY {
            let excess = self.history.len() - MAX_LOOP_HISTORY;
            self.history.drain(..excess);
        }
        if success {
            self.consecutive_errors = 0;
        } else {
            self.consecutive_errors += 1;
        }
    }

    pub fn pause(&mut self) {
        self.enabled = false;
        self.status = LoopStatus::Paused;
        self.current_task_id = None;
        self.last_work_start_at = None;
    }

    /// Normalize a record loaded from disk. Returns whether it should resume.
    ///
    /// A record saved mid-turn loses that turn without counting an error.
    pub fn restore(&mut self) -> bool {
        self.current_task_id = None;
        self.last_work_start_at = None;
        if self.enabled {
            self.status = LoopStatus::Resting;
            true
        } else {
            if self.status != LoopStatus::Paused {
                self.status = LoopStatus::Idle;
            }
            false
        }
    }
}

/// `min(2^errors × 30s, 15m)`; zero errors means no backoff.
pub fn backoff_delay(consecutive_errors: u32) -> Duration {
    if consecutive_errors == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(consecutive_errors.min(16));
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_CAP)
}

/// `niuma_<appId>_<millis>_<suffix>`; the random suffix keeps two turns
/// started in the same millisecond apart.
pub fn iteration_task_id(app_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("niuma_{}_{}_{}", app_id, Utc::now().timestamp_millis(), &suffix[..8])
}
