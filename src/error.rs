//! Error types for the task allocator.

use std::time::Duration;

use crate::model::{Availability, TaskStatus};

/// Top-level error type.
///
/// Only faults end up here. Validation-class outcomes of `assign`/`reassign`
/// are returned as typed failures inside `AssignmentResult` instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Reasons a finalize commit was refused by the store.
///
/// Everything except `Database` means the guards re-checked at commit time
/// no longer hold; nothing was written.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: String },

    #[error("Task {task_id} changed concurrently (expected {expected} v{expected_version}, found {found} v{found_version})")]
    Conflict {
        task_id: String,
        expected: TaskStatus,
        expected_version: u64,
        found: TaskStatus,
        found_version: u64,
    },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Worker {worker_id} not found")]
    WorkerNotFound { worker_id: String },

    #[error("Worker {worker_id} is {availability}")]
    WorkerUnavailable {
        worker_id: String,
        availability: Availability,
    },

    #[error("Worker {worker_id} at capacity ({max}/{max})")]
    CapacityExhausted { worker_id: String, max: u32 },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Advisor failure. Always recovered locally by falling back to the
/// algorithmic strategy; never surfaced to callers of `assign`/`reassign`.
#[derive(Debug, thiserror::Error)]
pub enum RecommendationError {
    #[error("No candidates to recommend from")]
    NoCandidates,

    #[error("Advisor timed out after {0:?}")]
    Timeout(Duration),

    #[error("Advisor call failed: {0}")]
    Provider(#[from] LlmError),

    #[error("Malformed advisor output: {0}")]
    Malformed(String),

    #[error("Advisor recommended {worker_id}, which is not a candidate")]
    NotACandidate { worker_id: String },
}

/// Result type alias for the allocator.
pub type Result<T> = std::result::Result<T, Error>;
