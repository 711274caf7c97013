use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Idea priority. Higher ranks are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("Invalid priority '{}'. Valid values: high, medium, low", other)),
        }
    }
}

/// A natural-language instruction for one application.
///
/// `identity` groups all revisions of one conversation; a different identity
/// means a different application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Idea {
    pub identity: String,
    /// Assigned by the pipeline as the next revision when absent.
    #[serde(default)]
    pub revision: Option<u32>,
    pub text: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl Idea {
    pub fn new(identity: impl Into<String>, text: impl Into<String>, priority: Priority) -> Self {
        Self {
            identity: identity.into(),
            revision: None,
            text: text.into(),
            priority,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = Some(revision);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }
}

/// What a completed task produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub app_id: String,
    pub revision: u32,
    pub summary: String,
}

/// Queued work wrapping one idea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub idea: Idea,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<TaskResult>,
}

impl Task {
    pub(crate) fn new(idea: Idea, max_attempts: u32) -> Self {
        Self {
            task_id: format!("task_{}", uuid::Uuid::new_v4().simple()),
            idea,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_error: None,
            result: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.idea.identity
    }

    pub fn priority(&self) -> Priority {
        self.idea.priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_rank_order() {
        assert!(Priority::High.rank() > Priority::Medium.rank());
        assert!(Priority::Medium.rank() > Priority::Low.rank());
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_idea_deserializes_with_defaults() {
        let idea: Idea =
            serde_json::from_str(r#"{"identity":"a.txt","text":"add a counter button"}"#).unwrap();
        assert_eq!(idea.priority, Priority::Medium);
        assert_eq!(idea.revision, None);
    }

    #[test]
    fn test_new_task_is_pending_with_prefixed_id() {
        let task = Task::new(Idea::new("a.txt", "hello", Priority::Low), 3);
        assert!(task.task_id.starts_with("task_"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.status.is_in_flight());
    }
}
