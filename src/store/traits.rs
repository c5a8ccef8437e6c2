//! `Store` trait, the single async interface for all persistence.
//!
//! Reads return owned snapshots. The only way to change a task's status,
//! its assignee, or a worker's `current_ongoing` is [`Store::commit`], which
//! applies the task mutation, every capacity change and the audit entry as
//! one unit, or nothing at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{CommitError, DatabaseError};
use crate::model::{LogEntry, Task, TaskStatus, Worker};

/// Filter for [`Store::query_tasks`]. Results are ordered by `due_at`, then id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    /// Only tasks with `due_at` strictly before this instant.
    pub due_before: Option<DateTime<Utc>>,
}

impl TaskQuery {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            due_before: None,
        }
    }

    pub fn due_before(mut self, at: DateTime<Utc>) -> Self {
        self.due_before = Some(at);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.due_before.is_none_or(|at| task.due_at < at)
    }
}

/// One unit of worker capacity moving in a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityChange {
    /// `current_ongoing += 1`, guarded by availability and max concurrency.
    Grant(String),
    /// `current_ongoing = max(0, current_ongoing - 1)`. A missing worker is skipped.
    Release(String),
}

/// The atomic finalize unit.
///
/// `task` is the desired post-state. Its `log` must be the log as loaded;
/// the store appends `entry` and bumps `version` itself.
#[derive(Debug, Clone)]
pub struct Commit {
    pub task: Task,
    pub expected_status: TaskStatus,
    pub expected_version: u64,
    pub capacity: Vec<CapacityChange>,
    pub entry: LogEntry,
}

impl Commit {
    /// Start a commit from the snapshot the decision was based on.
    pub fn from_snapshot(before: &Task, after: Task, entry: LogEntry) -> Self {
        Self {
            task: after,
            expected_status: before.status,
            expected_version: before.version,
            capacity: Vec::new(),
            entry,
        }
    }

    pub fn grant(mut self, worker_id: impl Into<String>) -> Self {
        self.capacity.push(CapacityChange::Grant(worker_id.into()));
        self
    }

    pub fn release(mut self, worker_id: impl Into<String>) -> Self {
        self.capacity.push(CapacityChange::Release(worker_id.into()));
        self
    }

    /// Reject post-states the status machine does not allow. Terminal
    /// tasks accept no commit at all.
    pub(crate) fn check_transition(&self) -> Result<(), CommitError> {
        let from = self.expected_status;
        let to = self.task.status;
        if from.is_terminal() || !from.can_transition_to(to) {
            return Err(CommitError::InvalidTransition {
                task_id: self.task.id.clone(),
                from,
                to,
            });
        }
        Ok(())
    }
}

/// Backend-agnostic persistence.
#[async_trait]
pub trait Store: Send + Sync {
    /// Get a task (with its full log) by ID.
    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError>;

    /// Get a worker by ID.
    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, DatabaseError>;

    /// Snapshot of all workers, ordered by id.
    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError>;

    /// Tasks matching the query, ordered by `due_at` then id.
    async fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, DatabaseError>;

    /// Register a task, or update the descriptive fields of an existing one
    /// (name, type, required skills, priority, due date). Lifecycle fields
    /// and the log of an existing task are left untouched.
    async fn save_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Register a worker, or update the profile of an existing one.
    /// The stored `current_ongoing` of an existing worker is kept.
    async fn save_worker(&self, worker: &Worker) -> Result<(), DatabaseError>;

    /// Apply a finalize unit atomically. Returns the committed task.
    async fn commit(&self, commit: &Commit) -> Result<Task, CommitError>;
}
