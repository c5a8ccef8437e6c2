//! Domain model: workers, tasks, and the audit log.

pub mod task;
pub mod worker;

pub use task::{
    CandidateSummary, LogAction, LogDetails, LogEntry, Priority, Task, TaskStatus,
};
pub use worker::{Availability, Experience, Worker};
