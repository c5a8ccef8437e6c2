//! In-memory `Store`: a single `RwLock` over all tasks and workers.
//!
//! Commits validate every guard against the locked state before touching
//! anything, so a refused commit leaves no trace.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{CommitError, DatabaseError};
use crate::model::{Task, Worker};
use crate::store::traits::{CapacityChange, Commit, Store, TaskQuery};

#[derive(Default)]
struct State {
    tasks: HashMap<String, Task>,
    workers: HashMap<String, Worker>,
}

/// Process-local store. Used by tests and embedded callers.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Apply capacity changes to copies of the affected workers.
///
/// Changes are applied in order, so a release followed by a grant on the
/// same worker sees the released value.
pub(crate) fn plan_capacity(
    workers: &HashMap<String, Worker>,
    changes: &[CapacityChange],
) -> Result<HashMap<String, Worker>, CommitError> {
    let mut touched: HashMap<String, Worker> = HashMap::new();

    for change in changes {
        match change {
            CapacityChange::Grant(id) => {
                let worker = match touched.entry(id.clone()) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => {
                        let w = workers.get(id).cloned().ok_or_else(|| {
                            CommitError::WorkerNotFound {
                                worker_id: id.clone(),
                            }
                        })?;
                        e.insert(w)
                    }
                };
                if !worker.is_available() {
                    return Err(CommitError::WorkerUnavailable {
                        worker_id: id.clone(),
                        availability: worker.availability,
                    });
                }
                if !worker.has_capacity() {
                    return Err(CommitError::CapacityExhausted {
                        worker_id: id.clone(),
                        max: worker.max_concurrent,
                    });
                }
                worker.current_ongoing += 1;
            }
            CapacityChange::Release(id) => {
                let worker = match touched.entry(id.clone()) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => match workers.get(id) {
                        Some(w) => e.insert(w.clone()),
                        None => {
                            warn!(worker_id = %id, "Release for unknown worker skipped");
                            continue;
                        }
                    },
                };
                worker.current_ongoing = worker.current_ongoing.saturating_sub(1);
            }
        }
    }

    Ok(touched)
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError> {
        Ok(self.state.read().await.tasks.get(id).cloned())
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, DatabaseError> {
        Ok(self.state.read().await.workers.get(id).cloned())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError> {
        let state = self.state.read().await;
        let mut workers: Vec<Worker> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, DatabaseError> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn save_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        match state.tasks.get_mut(&task.id) {
            Some(existing) => {
                existing.name = task.name.clone();
                existing.task_type = task.task_type.clone();
                existing.required_skills = task.required_skills.clone();
                existing.priority = task.priority;
                existing.due_at = task.due_at;
            }
            None => {
                state.tasks.insert(task.id.clone(), task.clone());
            }
        }
        debug!(task_id = %task.id, "Task saved");
        Ok(())
    }

    async fn save_worker(&self, worker: &Worker) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        match state.workers.get_mut(&worker.id) {
            Some(existing) => {
                if worker.max_concurrent < existing.current_ongoing {
                    return Err(DatabaseError::Constraint(format!(
                        "worker {}: max_concurrent {} below current load {}",
                        worker.id, worker.max_concurrent, existing.current_ongoing
                    )));
                }
                let ongoing = existing.current_ongoing;
                *existing = worker.clone();
                existing.current_ongoing = ongoing;
            }
            None => {
                if worker.current_ongoing > worker.max_concurrent {
                    return Err(DatabaseError::Constraint(format!(
                        "worker {}: current load {} exceeds max_concurrent {}",
                        worker.id, worker.current_ongoing, worker.max_concurrent
                    )));
                }
                state.workers.insert(worker.id.clone(), worker.clone());
            }
        }
        debug!(worker_id = %worker.id, "Worker saved");
        Ok(())
    }

    async fn commit(&self, commit: &Commit) -> Result<Task, CommitError> {
        let mut state = self.state.write().await;

        let stored = state
            .tasks
            .get(&commit.task.id)
            .ok_or_else(|| CommitError::TaskNotFound {
                task_id: commit.task.id.clone(),
            })?;

        if stored.status != commit.expected_status || stored.version != commit.expected_version {
            return Err(CommitError::Conflict {
                task_id: stored.id.clone(),
                expected: commit.expected_status,
                expected_version: commit.expected_version,
                found: stored.status,
                found_version: stored.version,
            });
        }

        commit.check_transition()?;

        let stored_log = stored.log.clone();
        let touched = plan_capacity(&state.workers, &commit.capacity)?;

        // All guards passed, apply.
        let now = commit.entry.timestamp;
        for (id, mut worker) in touched {
            worker.updated_at = now;
            state.workers.insert(id, worker);
        }

        let mut task = commit.task.clone();
        task.version = commit.expected_version + 1;
        task.log = stored_log;
        task.log.push(commit.entry.clone());
        state.tasks.insert(task.id.clone(), task.clone());

        debug!(
            task_id = %task.id,
            version = task.version,
            action = %commit.entry.action,
            "Commit applied"
        );
        Ok(task)
    }
}
