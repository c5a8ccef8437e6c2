//! Persistence layer: the `Store` trait and its in-memory and libSQL backends.

mod libsql_backend;
mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::{CapacityChange, Commit, Store, TaskQuery};
