//! First-time assignment of a pending task.

use std::time::Instant;

use tracing::{debug, info};

use super::advisor::{Recommendation, RecommendationRequest};
use super::filter::filter;
use super::result::{AssignmentResult, FailureKind, Method};
use super::{Dispatcher, elapsed_ms};
use crate::error::Error;
use crate::model::{LogAction, LogDetails, LogEntry, TaskStatus};
use crate::store::Commit;

impl Dispatcher {
    /// Assign a pending task.
    ///
    /// With `forced_worker` the worker is validated and used directly;
    /// otherwise candidates are ranked and the advisor chooses. Only
    /// persistence faults are returned as `Err`.
    pub async fn assign(
        &self,
        task_id: &str,
        forced_worker: Option<&str>,
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
        if task.status != TaskStatus::Pending {
            return Ok(AssignmentResult::failure(
                task_id,
                FailureKind::State,
                format!("Task is not pending (current status: {})", task.status),
            ));
        }

        let mut history_present = None;
        let (recommendation, summaries) = match forced_worker {
            Some(worker_id) => {
                let Some(worker) = self.store.get_worker(worker_id).await? else {
                    return Ok(AssignmentResult::failure(
                        task_id,
                        FailureKind::NotFound,
                        format!("Worker {worker_id} not found"),
                    ));
                };
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
                let rec = Recommendation {
                    worker_id: worker.id,
                    rationale: "Forced assignment".to_string(),
                    method: Method::Forced,
                };
                (rec, Vec::new())
            }
            None => {
                let workers = self.store.list_workers().await?;
                let candidates = filter(&task, &workers, &[]);
                if candidates.is_empty() {
                    return Ok(AssignmentResult::failure(
                        task_id,
                        FailureKind::NoEligibleCandidates,
                        "No available workers with the required skills",
                    ));
                }
                debug!(task_id = %task.id, candidates = candidates.len(), "Ranked candidates");

                let history = if self.advisor.wants_history() {
                    self.historical_context(&task).await
                } else {
                    None
                };
                history_present = Some(history.as_ref().is_some_and(|h| !h.is_empty()));

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

        let now = self.clock.now();
        let mut after = task.clone();
        after.status = TaskStatus::InProgress;
        after.assigned_worker = Some(recommendation.worker_id.clone());
        after.started_at.get_or_insert(now);

        let details = LogDetails {
            method: Some(recommendation.method.to_string()),
            rationale: Some(recommendation.rationale.clone()),
            to_worker: Some(recommendation.worker_id.clone()),
            from_status: Some(TaskStatus::Pending),
            to_status: Some(TaskStatus::InProgress),
            latency_ms: Some(elapsed_ms(started)),
            history_present,
            candidates: summaries,
            ..Default::default()
        };
        let commit = Commit::from_snapshot(&task, after, LogEntry::new(LogAction::Assigned, now, details))
            .grant(recommendation.worker_id.clone());

        match self.finalize(&commit).await? {
            Ok(_) => {
                info!(
                    task_id = %task.id,
                    worker_id = %recommendation.worker_id,
                    method = %recommendation.method,
                    "Task assigned"
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

    use chrono::Utc;

    use super::*;
    use crate::model::{Availability, Task, Worker};
    use crate::store::{MemoryStore, Store};

    async fn setup() -> (Arc<MemoryStore>, Dispatcher) {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(store.clone());
        (store, dispatcher)
    }

    #[tokio::test]
    async fn assigns_best_candidate_and_grants_capacity() {
        let (store, d) = setup().await;
        store
            .save_worker(&Worker::new("A", "a", 2).with_skill("go", 5))
            .await
            .unwrap();
        store
            .save_worker(&Worker::new("B", "b", 2).with_skill("go", 1))
            .await
            .unwrap();
        store
            .save_task(&Task::new("T", "t", Utc::now()).with_skill("go", 3))
            .await
            .unwrap();

        let result = d.assign("T", None).await.unwrap();
        assert_eq!(result.worker_id(), Some("A"));

        let task = store.get_task("T").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.started_at.is_some());
        let entry = &task.log[0];
        assert_eq!(entry.action, LogAction::Assigned);
        assert_eq!(entry.details.method.as_deref(), Some("algorithmic"));
        assert_eq!(entry.details.candidates.len(), 2);
        assert_eq!(store.get_worker("A").await.unwrap().unwrap().current_ongoing, 1);
        assert_eq!(store.get_worker("B").await.unwrap().unwrap().current_ongoing, 0);
    }

    #[tokio::test]
    async fn missing_task_and_wrong_state() {
        let (store, d) = setup().await;
        let r = d.assign("nope", None).await.unwrap();
        assert_eq!(r.failure_kind(), Some(FailureKind::NotFound));

        store
            .save_worker(&Worker::new("A", "a", 2).with_skill("go", 5))
            .await
            .unwrap();
        store
            .save_task(&Task::new("T", "t", Utc::now()).with_skill("go", 3))
            .await
            .unwrap();
        assert!(d.assign("T", None).await.unwrap().is_success());

        let again = d.assign("T", None).await.unwrap();
        assert_eq!(again.failure_kind(), Some(FailureKind::State));
        assert_eq!(store.get_worker("A").await.unwrap().unwrap().current_ongoing, 1);
    }

    #[tokio::test]
    async fn forced_assignment_checks() {
        let (store, d) = setup().await;
        store
            .save_worker(&Worker::new("away", "a", 2).with_availability(Availability::OnLeave))
            .await
            .unwrap();
        store
            .save_worker(&Worker::new("full", "f", 1).with_ongoing(1))
            .await
            .unwrap();
        store.save_worker(&Worker::new("ok", "o", 1)).await.unwrap();
        store.save_task(&Task::new("T", "t", Utc::now())).await.unwrap();

        let r = d.assign("T", Some("ghost")).await.unwrap();
        assert_eq!(r.failure_kind(), Some(FailureKind::NotFound));
        let r = d.assign("T", Some("away")).await.unwrap();
        assert_eq!(r.failure_kind(), Some(FailureKind::Availability));
        let r = d.assign("T", Some("full")).await.unwrap();
        assert_eq!(r.failure_kind(), Some(FailureKind::Capacity));

        // Forced assignment ignores skills.
        let r = d.assign("T", Some("ok")).await.unwrap();
        match r {
            AssignmentResult::Success { method, .. } => assert_eq!(method, Method::Forced),
            other => panic!("expected success, got {other:?}"),
        }
        let task = store.get_task("T").await.unwrap().unwrap();
        assert_eq!(task.log.len(), 1);
        assert!(task.log[0].details.candidates.is_empty());
    }

    #[tokio::test]
    async fn no_candidates_is_a_failure_without_side_effects() {
        let (store, d) = setup().await;
        store
            .save_worker(&Worker::new("A", "a", 2).with_skill("css", 5))
            .await
            .unwrap();
        store
            .save_task(&Task::new("T", "t", Utc::now()).with_skill("go", 3))
            .await
            .unwrap();

        let r = d.assign("T", None).await.unwrap();
        assert_eq!(r.failure_kind(), Some(FailureKind::NoEligibleCandidates));
        let task = store.get_task("T").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.log.is_empty());
    }
}
