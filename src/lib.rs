//! Task allocator: skill-based assignment and reassignment of tasks to
//! capacity-limited workers, with an audit trail and a periodic supervisor.

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod llm;
pub mod model;
pub mod store;
pub mod supervisor;

pub use config::AllocatorConfig;
pub use dispatch::{AssignmentResult, Dispatcher, FailureKind, LifecycleResult, ReassignOptions};
pub use error::{Error, Result};
pub use supervisor::{Supervisor, SupervisorHandle, SweepReport};
