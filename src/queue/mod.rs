//! Priority-ordered task queue keyed by idea identity.
//!
//! At most one task per identity may be pending or processing at a time;
//! a second submission is rejected rather than merged so two turns never
//! race on one application directory. Pacing between attempts is the
//! caller's job: a failed task is requeued immediately.

pub mod task;

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::errors::SubmitError;

pub use task::{Idea, Priority, Task, TaskResult, TaskStatus};

/// Terminal tasks kept for inspection.
const HISTORY_LIMIT: usize = 1000;

/// Terminal tasks shown by [`TaskQueue::details`].
const DETAILS_LIMIT: usize = 10;

/// Classifies a failure for the queue's retry decision.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDetails {
    pub pending: Vec<Task>,
    pub processing: Vec<Task>,
    pub completed: Vec<Task>,
    pub failed: Vec<Task>,
}

#[derive(Default)]
struct QueueInner {
    pending: Vec<Task>,
    processing: HashMap<String, Task>,
    completed: VecDeque<Task>,
    failed: VecDeque<Task>,
}

impl QueueInner {
    fn in_flight_for(&self, identity: &str) -> Option<&Task> {
        self.pending
            .iter()
            .chain(self.processing.values())
            .find(|t| t.identity() == identity)
    }

    /// Insert after every task of equal or higher priority.
    fn enqueue(&mut self, task: Task) {
        let rank = task.priority().rank();
        let pos = self
            .pending
            .iter()
            .position(|t| t.priority().rank() < rank)
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, task);
    }
}

fn push_bounded(list: &mut VecDeque<Task>, task: Task) {
    list.push_back(task);
    while list.len() > HISTORY_LIMIT {
        list.pop_front();
    }
}

fn tail(list: &VecDeque<Task>, n: usize) -> Vec<Task> {
    list.iter().skip(list.len().saturating_sub(n)).cloned().collect()
}

pub struct TaskQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept an idea, returning the new task id.
    pub fn submit(&self, idea: Idea) -> Result<String, SubmitError> {
        if idea.identity.trim().is_empty() {
            return Err(SubmitError::EmptyIdentity);
        }

        let mut inner = self.lock();
        if let Some(existing) = inner.in_flight_for(&idea.identity) {
            debug!(identity = %idea.identity, task_id = %existing.task_id, "rejecting duplicate idea");
            return Err(SubmitError::DuplicateInFlight {
                identity: idea.identity,
                task_id: existing.task_id.clone(),
            });
        }
        if inner.pending.len() >= self.config.max_size {
            return Err(SubmitError::QueueFull {
                capacity: self.config.max_size,
            });
        }

        let task = Task::new(idea, self.config.max_attempts);
        let task_id = task.task_id.clone();
        info!(
            task_id = %task_id,
            identity = %task.identity(),
            priority = %task.priority(),
            "task queued"
        );
        inner.enqueue(task);
        drop(inner);

        self.notify.notify_one();
        Ok(task_id)
    }

    /// Pop the highest-priority pending task and mark it processing.
    pub fn take_next(&self) -> Option<Task> {
        let mut inner = self.lock();
        if inner.pending.is_empty() {
            return None;
        }
        let mut task = inner.pending.remove(0);
        task.status = TaskStatus::Processing;
        task.started_at = Some(Utc::now());
        inner.processing.insert(task.task_id.clone(), task.clone());
        Some(task)
    }

    /// Wait until a task is available and take it.
    pub async fn next(&self) -> Task {
        loop {
            if let Some(task) = self.take_next() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    /// Mark a processing task completed. Returns false for unknown ids.
    pub fn complete(&self, task_id: &str, result: TaskResult) -> bool {
        let mut inner = self.lock();
        let Some(mut task) = inner.processing.remove(task_id) else {
            return false;
        };
        task.status = TaskStatus::Completed;
        task.finished_at = Some(Utc::now());
        task.result = Some(result);
        info!(task_id = %task_id, identity = %task.identity(), "task completed");
        push_bounded(&mut inner.completed, task);
        true
    }

    /// Record a failure and either requeue the task or fail it for good.
    ///
    /// Returns the task's resulting status, or `None` for unknown ids.
    pub fn fail<E>(&self, task_id: &str, error: &E) -> Option<TaskStatus>
    where
        E: Retryable + std::fmt::Display,
    {
        let mut inner = self.lock();
        let mut task = inner.processing.remove(task_id)?;

        task.attempts += 1;
        task.last_error = Some(error.to_string());
        if !error.is_retryable() {
            task.attempts = task.max_attempts;
        }

        if task.attempts < task.max_attempts {
            warn!(
                task_id = %task_id,
                attempt = task.attempts,
                max_attempts = task.max_attempts,
                error = %error,
                "task failed, requeueing"
            );
            task.status = TaskStatus::Pending;
            task.started_at = None;
            inner.enqueue(task);
            drop(inner);
            self.notify.notify_one();
            Some(TaskStatus::Pending)
        } else {
            warn!(task_id = %task_id, error = %error, "task failed permanently");
            task.status = TaskStatus::Failed;
            task.finished_at = Some(Utc::now());
            push_bounded(&mut inner.failed, task);
            Some(TaskStatus::Failed)
        }
    }

    pub fn is_in_flight(&self, identity: &str) -> bool {
        self.lock().in_flight_for(identity).is_some()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        let stats = QueueStats {
            pending: inner.pending.len(),
            processing: inner.processing.len(),
            completed: inner.completed.len(),
            failed: inner.failed.len(),
            total: 0,
        };
        QueueStats {
            total: stats.pending + stats.processing + stats.completed + stats.failed,
            ..stats
        }
    }

    /// In-flight tasks plus the most recent terminal ones.
    pub fn details(&self) -> QueueDetails {
        let inner = self.lock();
        let mut processing: Vec<Task> = inner.processing.values().cloned().collect();
        processing.sort_by_key(|t| t.started_at);
        QueueDetails {
            pending: inner.pending.clone(),
            processing,
            completed: tail(&inner.completed, DETAILS_LIMIT),
            failed: tail(&inner.failed, DETAILS_LIMIT),
        }
    }

    pub fn clear_completed(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.completed.len();
        inner.completed.clear();
        n
    }

    pub fn clear_failed(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.failed.len();
        inner.failed.clear();
        n
    }
}
