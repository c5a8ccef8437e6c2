//! Completion, blocking, resumption and overdue failure.

use tracing::info;

use super::Dispatcher;
use super::result::{FailureKind, LifecycleResult};
use crate::error::Error;
use crate::model::{LogAction, LogDetails, LogEntry, Task, TaskStatus};
use crate::store::Commit;

/// Reason recorded when the supervisor fails an overdue task.
pub const DEADLINE_PASSED: &str = "deadline_passed";

impl Dispatcher {
    /// `in_progress → completed`. Releases the assignee's slot.
    pub async fn complete(&self, task_id: &str) -> Result<LifecycleResult, Error> {
        let _guard = self.locks.acquire(task_id).await;
        let task = match self.load_in(task_id, &[TaskStatus::InProgress]).await? {
            Ok(task) => task,
            Err(failure) => return Ok(failure),
        };

        let now = self.clock.now();
        let mut after = task.clone();
        after.status = TaskStatus::Completed;
        after.completed_at = Some(now);

        let details = LogDetails {
            from_worker: task.assigned_worker.clone(),
            from_status: Some(TaskStatus::InProgress),
            to_status: Some(TaskStatus::Completed),
            ..Default::default()
        };
        let commit = release_assignee(
            &task,
            Commit::from_snapshot(&task, after, LogEntry::new(LogAction::Completed, now, details)),
        );
        self.settle(commit, TaskStatus::Completed).await
    }

    /// `in_progress → blocked`. The assignee is kept on the task but its
    /// slot is released.
    pub async fn block(&self, task_id: &str, reason: &str) -> Result<LifecycleResult, Error> {
        let _guard = self.locks.acquire(task_id).await;
        let task = match self.load_in(task_id, &[TaskStatus::InProgress]).await? {
            Ok(task) => task,
            Err(failure) => return Ok(failure),
        };

        let mut after = task.clone();
        after.status = TaskStatus::Blocked;

        let details = LogDetails {
            from_worker: task.assigned_worker.clone(),
            from_status: Some(TaskStatus::InProgress),
            to_status: Some(TaskStatus::Blocked),
            reason: Some(reason.to_string()),
            ..Default::default()
        };
        let now = self.clock.now();
        let commit = release_assignee(
            &task,
            Commit::from_snapshot(&task, after, LogEntry::new(LogAction::StatusChange, now, details)),
        );
        self.settle(commit, TaskStatus::Blocked).await
    }

    /// `blocked → in_progress` on the same assignee, re-acquiring a slot.
    pub async fn resume(&self, task_id: &str) -> Result<LifecycleResult, Error> {
        let _guard = self.locks.acquire(task_id).await;
        let task = match self.load_in(task_id, &[TaskStatus::Blocked]).await? {
            Ok(task) => task,
            Err(failure) => return Ok(failure),
        };
        let Some(worker_id) = task.assigned_worker.clone() else {
            return Ok(LifecycleResult::failure(
                task_id,
                FailureKind::Validation,
                "Blocked task has no assignee to resume with",
            ));
        };

        let mut after = task.clone();
        after.status = TaskStatus::InProgress;

        let details = LogDetails {
            to_worker: Some(worker_id.clone()),
            from_status: Some(TaskStatus::Blocked),
            to_status: Some(TaskStatus::InProgress),
            ..Default::default()
        };
        let now = self.clock.now();
        let commit =
            Commit::from_snapshot(&task, after, LogEntry::new(LogAction::StatusChange, now, details))
                .grant(worker_id);
        self.settle(commit, TaskStatus::InProgress).await
    }

    /// Terminal failure for a task past its deadline.
    ///
    /// Accepts `in_progress` and `blocked`; only an in-progress task still
    /// holds a slot to release.
    pub async fn fail_overdue(&self, task_id: &str) -> Result<LifecycleResult, Error> {
        let _guard = self.locks.acquire(task_id).await;
        let task = match self
            .load_in(task_id, &[TaskStatus::InProgress, TaskStatus::Blocked])
            .await?
        {
            Ok(task) => task,
            Err(failure) => return Ok(failure),
        };

        let mut after = task.clone();
        after.status = TaskStatus::Failed;

        let details = LogDetails {
            from_worker: task.assigned_worker.clone(),
            from_status: Some(task.status),
            to_status: Some(TaskStatus::Failed),
            reason: Some(DEADLINE_PASSED.to_string()),
            ..Default::default()
        };
        let now = self.clock.now();
        let mut commit =
            Commit::from_snapshot(&task, after, LogEntry::new(LogAction::Failed, now, details));
        if task.status == TaskStatus::InProgress {
            commit = release_assignee(&task, commit);
        }
        self.settle(commit, TaskStatus::Failed).await
    }

    /// Load a task and require one of `allowed` statuses.
    async fn load_in(
        &self,
        task_id: &str,
        allowed: &[TaskStatus],
    ) -> Result<Result<Task, LifecycleResult>, Error> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(Err(LifecycleResult::failure(
                task_id,
                FailureKind::NotFound,
                format!("Task {task_id} not found"),
            )));
        };
        if !allowed.contains(&task.status) {
            let expected: Vec<&str> = allowed.iter().map(|s| s.as_str()).collect();
            return Ok(Err(LifecycleResult::failure(
                task_id,
                FailureKind::State,
                format!(
                    "Task is not {} (current status: {})",
                    expected.join(" or "),
                    task.status
                ),
            )));
        }
        Ok(Ok(task))
    }

    async fn settle(&self, commit: Commit, status: TaskStatus) -> Result<LifecycleResult, Error> {
        let task_id = commit.task.id.clone();
        match self.finalize(&commit).await? {
            Ok(_) => {
                info!(task_id = %task_id, status = %status, "Task status changed");
                Ok(LifecycleResult::Success { task_id, status })
            }
            Err((kind, reason)) => Ok(LifecycleResult::failure(&task_id, kind, reason)),
        }
    }
}

fn release_assignee(task: &Task, commit: Commit) -> Commit {
    match &task.assigned_worker {
        Some(worker_id) => commit.release(worker_id.clone()),
        None => commit,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::model::Worker;
    use crate::store::{MemoryStore, Store};

    async fn assigned() -> (Arc<MemoryStore>, Dispatcher) {
        let store = Arc::new(MemoryStore::new());
        store
            .save_worker(&Worker::new("A", "a", 1).with_skill("go", 3))
            .await
            .unwrap();
        store
            .save_task(&Task::new("T", "t", Utc::now()).with_skill("go", 3))
            .await
            .unwrap();
        let d = Dispatcher::new(store.clone());
        assert!(d.assign("T", None).await.unwrap().is_success());
        (store, d)
    }

    async fn load(store: &MemoryStore) -> u32 {
        store.get_worker("A").await.unwrap().unwrap().current_ongoing
    }

    #[tokio::test]
    async fn complete_releases_once() {
        let (store, d) = assigned().await;
        let r = d.complete("T").await.unwrap();
        assert_eq!(
            r,
            LifecycleResult::Success {
                task_id: "T".into(),
                status: TaskStatus::Completed
            }
        );
        assert_eq!(load(&store).await, 0);

        let again = d.complete("T").await.unwrap();
        assert_eq!(again.failure_kind(), Some(FailureKind::State));
        assert_eq!(load(&store).await, 0);

        let task = store.get_task("T").await.unwrap().unwrap();
        assert!(task.completed_at.is_some());
        assert_eq!(task.log.last().unwrap().action, LogAction::Completed);
        assert_eq!(task.log.len(), 2);
    }

    #[tokio::test]
    async fn block_then_resume() {
        let (store, d) = assigned().await;
        assert!(d.block("T", "waiting on review").await.unwrap().is_success());
        assert_eq!(load(&store).await, 0);

        let task = store.get_task("T").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.assigned_worker.as_deref(), Some("A"));
        let entry = task.log.last().unwrap();
        assert_eq!(entry.action, LogAction::StatusChange);
        assert_eq!(entry.details.reason.as_deref(), Some("waiting on review"));

        assert!(d.resume("T").await.unwrap().is_success());
        assert_eq!(load(&store).await, 1);
        assert_eq!(
            store.get_task("T").await.unwrap().unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[tokio::test]
    async fn resume_refused_when_assignee_is_full() {
        let (store, d) = assigned().await;
        d.block("T", "x").await.unwrap();
        store
            .save_task(&Task::new("U", "u", Utc::now()).with_skill("go", 1))
            .await
            .unwrap();
        assert!(d.assign("U", None).await.unwrap().is_success());

        let r = d.resume("T").await.unwrap();
        assert_eq!(r.failure_kind(), Some(FailureKind::Capacity));
        assert_eq!(
            store.get_task("T").await.unwrap().unwrap().status,
            TaskStatus::Blocked
        );
    }

    #[tokio::test]
    async fn fail_overdue_records_reason() {
        let (store, d) = assigned().await;
        let r = d.fail_overdue("T").await.unwrap();
        assert!(r.is_success());
        assert_eq!(load(&store).await, 0);

        let task = store.get_task("T").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let entry = task.log.last().unwrap();
        assert_eq!(entry.action, LogAction::Failed);
        assert_eq!(entry.details.reason.as_deref(), Some(DEADLINE_PASSED));
    }

    #[tokio::test]
    async fn fail_blocked_task_does_not_release_twice() {
        let (store, d) = assigned().await;
        d.block("T", "x").await.unwrap();
        assert!(d.fail_overdue("T").await.unwrap().is_success());
        assert_eq!(load(&store).await, 0);
    }

    #[tokio::test]
    async fn pending_task_cannot_complete() {
        let store = Arc::new(MemoryStore::new());
        store.save_task(&Task::new("T", "t", Utc::now())).await.unwrap();
        let d = Dispatcher::new(store);
        let r = d.complete("T").await.unwrap();
        assert_eq!(r.failure_kind(), Some(FailureKind::State));
        let r = d.block("missing", "x").await.unwrap();
        assert_eq!(r.failure_kind(), Some(FailureKind::NotFound));
    }
}
