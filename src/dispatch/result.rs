//! Typed outcomes of dispatch operations.

use serde::{Deserialize, Serialize};

use crate::error::{CommitError, Error};
use crate::model::TaskStatus;

/// How a worker was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Caller-specified worker on first assignment.
    Forced,
    /// Caller-specified worker on reassignment.
    Manual,
    /// Top-ranked candidate.
    Algorithmic,
    /// External advisor recommendation.
    Generative,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forced => "forced",
            Self::Manual => "manual",
            Self::Algorithmic => "algorithmic",
            Self::Generative => "generative",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation-class failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    State,
    Capacity,
    Availability,
    Validation,
    NoEligibleCandidates,
    NoOp,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::State => "state",
            Self::Capacity => "capacity",
            Self::Availability => "availability",
            Self::Validation => "validation",
            Self::NoEligibleCandidates => "no_eligible_candidates",
            Self::NoOp => "no_op",
        };
        f.write_str(s)
    }
}

/// Outcome of `assign` / `reassign`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AssignmentResult {
    Success {
        task_id: String,
        worker_id: String,
        method: Method,
        rationale: String,
    },
    Failure {
        task_id: String,
        kind: FailureKind,
        reason: String,
    },
}

impl AssignmentResult {
    pub fn failure(task_id: &str, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::Failure {
            task_id: task_id.to_string(),
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The chosen worker, on success.
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Self::Success { worker_id, .. } => Some(worker_id),
            Self::Failure { .. } => None,
        }
    }

    /// The failure kind, on failure.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// Outcome of `complete` / `block` / `fail_overdue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LifecycleResult {
    Success {
        task_id: String,
        status: TaskStatus,
    },
    Failure {
        task_id: String,
        kind: FailureKind,
        reason: String,
    },
}

impl LifecycleResult {
    pub fn failure(task_id: &str, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::Failure {
            task_id: task_id.to_string(),
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// Classify a refused commit. Persistence faults stay errors; everything
/// else means a guard no longer held and becomes a typed failure.
pub(crate) fn classify_commit_error(err: CommitError) -> Result<(FailureKind, String), Error> {
    let reason = err.to_string();
    let kind = match err {
        CommitError::Database(db) => return Err(Error::Database(db)),
        CommitError::TaskNotFound { .. } | CommitError::WorkerNotFound { .. } => {
            FailureKind::NotFound
        }
        CommitError::Conflict { .. } | CommitError::InvalidTransition { .. } => FailureKind::State,
        CommitError::WorkerUnavailable { .. } => FailureKind::Availability,
        CommitError::CapacityExhausted { .. } => FailureKind::Capacity,
    };
    Ok((kind, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;

    #[test]
    fn capacity_refusal_is_a_failure() {
        let (kind, reason) = classify_commit_error(CommitError::CapacityExhausted {
            worker_id: "W".into(),
            max: 2,
        })
        .unwrap();
        assert_eq!(kind, FailureKind::Capacity);
        assert!(reason.contains("W"));
    }

    #[test]
    fn invalid_transition_is_a_state_failure() {
        let (kind, reason) = classify_commit_error(CommitError::InvalidTransition {
            task_id: "T".into(),
            from: TaskStatus::Completed,
            to: TaskStatus::Pending,
        })
        .unwrap();
        assert_eq!(kind, FailureKind::State);
        assert!(reason.contains("completed to pending"));
    }

    #[test]
    fn database_fault_stays_an_error() {
        let err = classify_commit_error(CommitError::Database(DatabaseError::Query("x".into())));
        assert!(matches!(err, Err(Error::Database(_))));
    }

    #[test]
    fn result_serializes_with_tag() {
        let r = AssignmentResult::failure("T1", FailureKind::NoOp, "same worker");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["result"], "failure");
        assert_eq!(json["kind"], "no_op");
    }
}
