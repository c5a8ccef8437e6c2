//! Transfer of an in-progress task to another worker.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::advisor::{Recommendation, RecommendationRequest};
use super::filter::filter;
use super::result::{AssignmentResult, FailureKind, Method};
use super::{Dispatcher, elapsed_ms};
use crate::error::Error;
use crate::history::HistoricalContext;
use crate::model::{LogAction, LogDetails, LogEntry, TaskStatus};
use crate::store::Commit;

/// Optional inputs to [`Dispatcher::reassign`].
#[derive(Debug, Clone, Default)]
pub struct ReassignOptions {
    /// Target worker for a manual override.
    pub forced_worker: Option<String>,
    /// New due date, written in the same commit. Must not be in the past.
    pub new_due_at: Option<DateTime<Utc>>,
    /// Pre-fetched context; fetched from the history source when absent.
    pub history: Option<HistoricalContext>,
}

impl ReassignOptions {
    /// Manual override to `worker_id`.
    pub fn manual(worker_id: impl Into<String>) -> Self {
        Self {
            forced_worker: Some(worker_id.into()),
            ..Self::default()
        }
    }

    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.new_due_at = Some(due_at);
        self
    }

    pub fn with_history(mut self, history: HistoricalContext) -> Self {
        self.history = Some(history);
        self
    }
}

impl Dispatcher {
    /// Move an in-progress task to a different worker.
    ///
    /// The previous assignee's capacity is released and the new one's
    /// granted in the same commit. The task stays `in_progress`.
    pub async fn reassign(
        &self,
        task_id: &str,
        options: ReassignOptions,
    ) -> Result<AssignmentResult, Error> {
        let _guard = self.locks.acquire(task_id).await;
        let started = Instant::now();

        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(AssignmentResult::failure(
                task_id,
                FailureKind::NotFound,
                format!("Task {task_id} not found"),
            ));
        };
        if task.status != TaskStatus::InProgress {
            return Ok(AssignmentResult::failure(
                task_id,
                FailureKind::State,
                format!("Task is not in_progress (current status: {})", task.status),
            ));
        }
        let previous = task.assigned_worker.clone();

        let now = self.clock.now();
        if let Some(due) = options.new_due_at
            && due < now
        {
            return Ok(AssignmentResult::failure(
                task_id,
                FailureKind::Validation,
                format!("New due date {} is in the past", due.to_rfc3339()),
            ));
        }

        let history = match options.history {
            Some(ctx) => Some(ctx),
            None => self.historical_context(&task).await,
        };
        let history_present = history.as_ref().is_some_and(|h| !h.is_empty());

        let (recommendation, summaries) = match options.forced_worker.as_deref() {
            Some(worker_id) => {
                let Some(worker) = self.store.get_worker(worker_id).await? else {
                    return Ok(AssignmentResult::failure(
                        task_id,
                        FailureKind::NotFound,
                        format!("Worker {worker_id} not found"),
                    ));
                };
                if previous.as_deref() == Some(worker.id.as_str()) {
                    return Ok(AssignmentResult::failure(
                        task_id,
                        FailureKind::NoOp,
                        format!("Task is already assigned to {}", worker.id),
                    ));
                }
                if !worker.is_available() {
                    return Ok(AssignmentResult::failure(
                        task_id,
                        FailureKind::Availability,
                        format!("Worker {} is {}", worker.id, worker.availability),
                    ));
                }
                if !worker.has_capacity() {
                    return Ok(AssignmentResult::failure(
                        task_id,
                        FailureKind::Capacity,
                        format!(
                            "Worker {} is at max capacity ({})",
                            worker.id,
                            worker.load_label()
                        ),
                    ));
                }
                if let Some(ctx) = &history
                    && !ctx.is_empty()
                    && ctx.success_rate_for(&worker.id).is_none()
                {
                    warn!(task_id = %task.id, worker_id = %worker.id, "Target has no history with similar tasks");
                }
                let rec = Recommendation {
                    worker_id: worker.id,
                    rationale: "Admin override".to_string(),
                    method: Method::Manual,
                };
                (rec, Vec::new())
            }
            None => {
                let workers = self.store.list_workers().await?;
                let exclude: Vec<&str> = previous.as_deref().into_iter().collect();
                let candidates = filter(&task, &workers, &exclude);
                if candidates.is_empty() {
                    return Ok(AssignmentResult::failure(
                        task_id,
                        FailureKind::NoEligibleCandidates,
                        "No qualified candidates other than the current assignee",
                    ));
                }
                debug!(task_id = %task.id, candidates = candidates.len(), "Ranked reassignment candidates");

                let rec = match self
                    .advisor
                    .recommend(&RecommendationRequest {
                        task: &task,
                        candidates: &candidates,
                        history: history.as_ref(),
                    })
                    .await
                {
                    Ok(rec) => rec,
                    Err(e) => {
                        return Ok(AssignmentResult::failure(
                            task_id,
                            FailureKind::NoEligibleCandidates,
                            e.to_string(),
                        ));
                    }
                };
                (rec, candidates.iter().map(|c| c.summary()).collect())
            }
        };

        let mut after = task.clone();
        after.assigned_worker = Some(recommendation.worker_id.clone());
        after.reassigned_count += 1;
        if let Some(due) = options.new_due_at {
            after.due_at = due;
        }

        let details = LogDetails {
            method: Some(recommendation.method.to_string()),
            rationale: Some(recommendation.rationale.clone()),
            from_worker: previous.clone(),
            to_worker: Some(recommendation.worker_id.clone()),
            from_status: Some(TaskStatus::InProgress),
            to_status: Some(TaskStatus::InProgress),
            latency_ms: Some(elapsed_ms(started)),
            history_present: Some(history_present),
            candidates: summaries,
            ..Default::default()
        };
        let mut commit =
            Commit::from_snapshot(&task, after, LogEntry::new(LogAction::Reassigned, now, details));
        if let Some(prev) = &previous {
            commit = commit.release(prev.clone());
        }
        let commit = commit.grant(recommendation.worker_id.clone());

        match self.finalize(&commit).await? {
            Ok(_) => {
                info!(
                    task_id = %task.id,
                    from = previous.as_deref().unwrap_or("-"),
                    worker_id = %recommendation.worker_id,
                    method = %recommendation.method,
                    "Task reassigned"
                );
                Ok(AssignmentResult::Success {
                    task_id: task.id,
                    worker_id: recommendation.worker_id,
                    method: recommendation.method,
                    rationale: recommendation.rationale,
                })
            }
            Err((kind, reason)) => Ok(AssignmentResult::failure(task_id, kind, reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::model::{Task, Worker};
    use crate::store::{MemoryStore, Store};

    async fn in_progress_on_a() -> (Arc<MemoryStore>, Dispatcher) {
        let store = Arc::new(MemoryStore::new());
        store
            .save_worker(&Worker::new("A", "a", 2).with_skill("go", 5))
            .await
            .unwrap();
        store
            .save_worker(&Worker::new("B", "b", 2).with_skill("go", 3))
            .await
            .unwrap();
        store
            .save_task(&Task::new("T", "t", Utc::now() + Duration::days(1)).with_skill("go", 3))
            .await
            .unwrap();
        let d = Dispatcher::new(store.clone());
        assert_eq!(d.assign("T", None).await.unwrap().worker_id(), Some("A"));
        (store, d)
    }

    #[tokio::test]
    async fn automatic_moves_to_next_best() {
        let (store, d) = in_progress_on_a().await;
        let r = d.reassign("T", ReassignOptions::default()).await.unwrap();
        assert_eq!(r.worker_id(), Some("B"));

        let task = store.get_task("T").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.reassigned_count, 1);
        let entry = task.log.last().unwrap();
        assert_eq!(entry.action, LogAction::Reassigned);
        assert_eq!(entry.details.from_worker.as_deref(), Some("A"));
        assert_eq!(entry.details.to_worker.as_deref(), Some("B"));
        assert_eq!(entry.details.history_present, Some(false));
        assert_eq!(store.get_worker("A").await.unwrap().unwrap().current_ongoing, 0);
        assert_eq!(store.get_worker("B").await.unwrap().unwrap().current_ongoing, 1);
    }

    #[tokio::test]
    async fn manual_to_current_assignee_is_noop() {
        let (store, d) = in_progress_on_a().await;
        let r = d.reassign("T", ReassignOptions::manual("A")).await.unwrap();
        assert_eq!(r.failure_kind(), Some(FailureKind::NoOp));

        let task = store.get_task("T").await.unwrap().unwrap();
        assert_eq!(task.log.len(), 1);
        assert_eq!(task.version, 1);
        assert_eq!(store.get_worker("A").await.unwrap().unwrap().current_ongoing, 1);
    }

    #[tokio::test]
    async fn manual_with_new_due_date() {
        let (store, d) = in_progress_on_a().await;
        let due = Utc::now() + Duration::days(10);
        let r = d
            .reassign("T", ReassignOptions::manual("B").with_due_at(due))
            .await
            .unwrap();
        match &r {
            AssignmentResult::Success { method, rationale, .. } => {
                assert_eq!(*method, Method::Manual);
                assert_eq!(rationale, "Admin override");
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(store.get_task("T").await.unwrap().unwrap().due_at, due);
    }

    #[tokio::test]
    async fn past_due_date_rejected() {
        let (store, d) = in_progress_on_a().await;
        let r = d
            .reassign(
                "T",
                ReassignOptions::manual("B").with_due_at(Utc::now() - Duration::hours(1)),
            )
            .await
            .unwrap();
        assert_eq!(r.failure_kind(), Some(FailureKind::Validation));
        assert_eq!(store.get_task("T").await.unwrap().unwrap().reassigned_count, 0);
    }

    #[tokio::test]
    async fn pending_task_cannot_be_reassigned() {
        let store = Arc::new(MemoryStore::new());
        store.save_task(&Task::new("T", "t", Utc::now())).await.unwrap();
        let d = Dispatcher::new(store);
        let r = d.reassign("T", ReassignOptions::default()).await.unwrap();
        assert_eq!(r.failure_kind(), Some(FailureKind::State));
    }

    #[tokio::test]
    async fn only_current_assignee_qualifies() {
        let (store, d) = in_progress_on_a().await;
        store
            .save_worker(&Worker::new("B", "b", 2).with_skill("css", 3))
            .await
            .unwrap();
        let r = d.reassign("T", ReassignOptions::default()).await.unwrap();
        assert_eq!(r.failure_kind(), Some(FailureKind::NoEligibleCandidates));
        assert_eq!(
            store.get_task("T").await.unwrap().unwrap().assigned_worker.as_deref(),
            Some("A")
        );
    }
}
