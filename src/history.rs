//! Historical context: similar past tasks and how they ended.
//!
//! Retrieval is best-effort input to the generative advisor. An empty or
//! failed retrieval is a valid result and never blocks an assignment.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::model::{Task, TaskStatus};
use crate::store::{Store, TaskQuery};

/// How a past task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
}

/// One similar past task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalOutcome {
    pub task_id: String,
    pub task_name: String,
    pub worker_id: String,
    pub outcome: Outcome,
    /// Wall time from start to completion, when both are known.
    pub duration_secs: Option<i64>,
    /// Skill-name overlap with the query task, in `(0, 1]`.
    pub similarity: f64,
}

/// Context handed to the advisor alongside the candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalContext {
    pub similar: Vec<HistoricalOutcome>,
}

impl HistoricalContext {
    pub fn new(similar: Vec<HistoricalOutcome>) -> Self {
        Self { similar }
    }

    pub fn is_empty(&self) -> bool {
        self.similar.is_empty()
    }

    /// Fraction of this worker's similar tasks that succeeded.
    pub fn success_rate_for(&self, worker_id: &str) -> Option<f64> {
        let (total, ok) = self
            .similar
            .iter()
            .filter(|h| h.worker_id == worker_id)
            .fold((0u32, 0u32), |(total, ok), h| {
                (total + 1, ok + u32::from(h.outcome == Outcome::Success))
            });
        (total > 0).then(|| f64::from(ok) / f64::from(total))
    }
}

/// Source of similar past tasks.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn retrieve_similar(
        &self,
        task: &Task,
        top_k: usize,
    ) -> Result<Vec<HistoricalOutcome>, DatabaseError>;
}

/// History backed by finished tasks in the store.
pub struct StoreHistory {
    store: Arc<dyn Store>,
}

impl StoreHistory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

/// Jaccard overlap of required skill names.
fn skill_overlap(a: &Task, b: &Task) -> f64 {
    let left: BTreeSet<&str> = a.required_skills.keys().map(String::as_str).collect();
    let right: BTreeSet<&str> = b.required_skills.keys().map(String::as_str).collect();
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

fn to_outcome(query: &Task, past: Task) -> Option<HistoricalOutcome> {
    if past.id == query.id {
        return None;
    }
    let worker_id = past.assigned_worker.clone()?;
    let similarity = skill_overlap(query, &past);
    if similarity <= 0.0 {
        return None;
    }
    let outcome = match past.status {
        TaskStatus::Completed => Outcome::Success,
        _ => Outcome::Failed,
    };
    let duration_secs = match (past.started_at, past.completed_at) {
        (Some(start), Some(end)) => Some((end - start).num_seconds()),
        _ => None,
    };
    Some(HistoricalOutcome {
        task_id: past.id,
        task_name: past.name,
        worker_id,
        outcome,
        duration_secs,
        similarity,
    })
}

#[async_trait]
impl HistorySource for StoreHistory {
    async fn retrieve_similar(
        &self,
        task: &Task,
        top_k: usize,
    ) -> Result<Vec<HistoricalOutcome>, DatabaseError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut finished = self
            .store
            .query_tasks(&TaskQuery::status(TaskStatus::Completed))
            .await?;
        finished.extend(
            self.store
                .query_tasks(&TaskQuery::status(TaskStatus::Failed))
                .await?,
        );

        let mut similar: Vec<HistoricalOutcome> = finished
            .into_iter()
            .filter_map(|past| to_outcome(task, past))
            .collect();
        similar.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        similar.truncate(top_k);

        tracing::debug!(task_id = %task.id, found = similar.len(), "Retrieved similar tasks");
        Ok(similar)
    }
}
