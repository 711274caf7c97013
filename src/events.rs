//! Observer event stream.
//!
//! Events are at-most-once and best-effort: a broadcast with no receivers, or
//! a lagging receiver, loses visibility only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One entry of an agent's plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub content: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Waiting for an approve/reject answer.
    Pending,
    Approved,
    Rejected,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    AssistantChunk {
        text: String,
    },
    PlanUpdate {
        entries: Vec<PlanEntry>,
    },
    ToolCall {
        call_id: String,
        tool_name: Option<String>,
        kind: String,
        status: ToolCallStatus,
    },
    StatusLine {
        text: String,
    },
    Error {
        message: String,
    },
    Finished {
        success: bool,
        summary: String,
    },
}

impl Event {
    pub fn assistant_chunk(text: impl Into<String>) -> Self {
        Event::AssistantChunk { text: text.into() }
    }

    pub fn plan_update(entries: Vec<PlanEntry>) -> Self {
        Event::PlanUpdate { entries }
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        tool_name: Option<String>,
        kind: impl Into<String>,
        status: ToolCallStatus,
    ) -> Self {
        Event::ToolCall {
            call_id: call_id.into(),
            tool_name,
            kind: kind.into(),
            status,
        }
    }

    pub fn status_line(text: impl Into<String>) -> Self {
        Event::StatusLine { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            message: message.into(),
        }
    }

    pub fn finished(success: bool, summary: impl Into<String>) -> Self {
        Event::Finished {
            success,
            summary: summary.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

/// Broadcast fan-out of [`EventEnvelope`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, envelope: EventEnvelope) {
        let _ = self.tx.send(envelope); // Ignore error if no receivers
    }

    pub fn emit(&self, task_id: Option<&str>, app_id: Option<&str>, event: Event) {
        self.publish(EventEnvelope {
            task_id: task_id.map(str::to_string),
            app_id: app_id.map(str::to_string),
            timestamp: Utc::now(),
            event,
        });
    }

    /// An emitter that tags every event with the same task and app.
    pub fn scoped(&self, task_id: &str, app_id: &str) -> EventScope {
        EventScope {
            bus: self.clone(),
            task_id: task_id.to_string(),
            app_id: app_id.to_string(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Debug, Clone)]
pub struct EventScope {
    bus: EventBus,
    task_id: String,
    app_id: String,
}

impl EventScope {
    pub fn emit(&self, event: Event) {
        self.bus
            .emit(Some(&self.task_id), Some(&self.app_id), event);
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }
}
