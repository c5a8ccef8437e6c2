//! Task data model, status state machine, and audit log entries.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a first assignment.
    Pending,
    /// Assigned and being worked on.
    InProgress,
    /// Work cannot continue; capacity has been released.
    Blocked,
    /// Transient marker between two assignees.
    Reassigned,
    /// Work is done.
    Completed,
    /// Gave up, usually because the deadline passed.
    Failed,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, InProgress) |
            (InProgress, Completed) | (InProgress, Blocked) | (InProgress, Failed) |
            (InProgress, Reassigned) | (InProgress, InProgress) |
            (Reassigned, InProgress) | (Reassigned, Blocked) |
            (Blocked, InProgress) | (Blocked, Failed)
        )
    }

    /// Completed and failed tasks are immutable to the engine.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Reassigned => "reassigned",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "reassigned" => Ok(Self::Reassigned),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// What a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Assigned,
    Reassigned,
    Completed,
    StatusChange,
    Failed,
}

impl std::fmt::Display for LogAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Assigned => "assigned",
            Self::Reassigned => "reassigned",
            Self::Completed => "completed",
            Self::StatusChange => "status_change",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for LogAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(Self::Assigned),
            "reassigned" => Ok(Self::Reassigned),
            "completed" => Ok(Self::Completed),
            "status_change" => Ok(Self::StatusChange),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown log action: {other}")),
        }
    }
}

/// Compact view of a ranked candidate, kept in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub worker_id: String,
    pub score: f64,
    pub load: String,
}

/// Structured details of a log entry. Unused fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_status: Option<TaskStatus>,
    /// Time spent choosing the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_present: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<CandidateSummary>,
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: LogAction,
    pub details: LogDetails,
}

impl LogEntry {
    pub fn new(action: LogAction, timestamp: DateTime<Utc>, details: LogDetails) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            action,
            details,
        }
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique ID.
    pub id: String,
    /// Short name.
    pub name: String,
    /// Free-form kind of work (feature, bug, ...). Advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    /// Skill name to required level.
    pub required_skills: BTreeMap<String, u32>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
    pub priority: Priority,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of committed reassignments. Never decreases.
    pub reassigned_count: u32,
    /// Bumped by every committed finalize; used as the commit guard.
    pub version: u64,
    /// Append-only audit trail, oldest first.
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

impl Task {
    /// Create a pending task.
    pub fn new(id: impl Into<String>, name: impl Into<String>, due_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            task_type: None,
            required_skills: BTreeMap::new(),
            status: TaskStatus::Pending,
            assigned_worker: None,
            priority: Priority::default(),
            due_at,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            reassigned_count: 0,
            version: 0,
            log: Vec::new(),
        }
    }

    /// Builder: add a required skill.
    pub fn with_skill(mut self, skill: impl Into<String>, level: u32) -> Self {
        self.required_skills.insert(skill.into(), level);
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set task type.
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Timestamp of the most recent `reassigned` entry, scanning newest first.
    pub fn last_reassigned_at(&self) -> Option<DateTime<Utc>> {
        self.log
            .iter()
            .rev()
            .find(|e| e.action == LogAction::Reassigned)
            .map(|e| e.timestamp)
    }

    /// Whether the task was reassigned less than `cooldown` before `now`.
    pub fn in_reassign_cooldown(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
        match self.last_reassigned_at() {
            Some(at) => now.signed_duration_since(at) < cooldown,
            None => false,
        }
    }

    /// `status == in_progress ⇒ assigned_worker is set`.
    pub fn assignment_consistent(&self) -> bool {
        self.status != TaskStatus::InProgress || self.assigned_worker.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: LogAction, at: DateTime<Utc>) -> LogEntry {
        LogEntry::new(action, at, LogDetails::default())
    }

    #[test]
    fn status_transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Blocked));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Reassigned.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn status_serde_matches_display() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
        assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
    }

    #[test]
    fn last_reassigned_picks_most_recent() {
        let t0 = Utc::now();
        let mut task = Task::new("T1", "Port parser", t0);
        task.log.push(entry(LogAction::Assigned, t0));
        task.log.push(entry(LogAction::Reassigned, t0 + chrono::Duration::hours(1)));
        task.log.push(entry(LogAction::Reassigned, t0 + chrono::Duration::hours(5)));
        task.log.push(entry(LogAction::StatusChange, t0 + chrono::Duration::hours(6)));

        assert_eq!(task.last_reassigned_at(), Some(t0 + chrono::Duration::hours(5)));
    }

    #[test]
    fn cooldown_window() {
        let t0 = Utc::now();
        let mut task = Task::new("T1", "Port parser", t0);
        let day = chrono::Duration::hours(24);
        assert!(!task.in_reassign_cooldown(t0, day));

        task.log.push(entry(LogAction::Reassigned, t0));
        assert!(task.in_reassign_cooldown(t0 + chrono::Duration::hours(1), day));
        assert!(!task.in_reassign_cooldown(t0 + chrono::Duration::hours(24), day));
    }

    #[test]
    fn log_details_skip_empty_fields() {
        let details = LogDetails {
            method: Some("forced".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json, serde_json::json!({ "method": "forced" }));
    }

    #[test]
    fn in_progress_requires_assignee() {
        let mut task = Task::new("T1", "x", Utc::now());
        assert!(task.assignment_consistent());
        task.status = TaskStatus::InProgress;
        assert!(!task.assignment_consistent());
        task.assigned_worker = Some("W1".into());
        assert!(task.assignment_consistent());
    }
}
