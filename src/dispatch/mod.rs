//! Assignment, reassignment and lifecycle transitions.
//!
//! Every operation follows the same shape: take the per-task lock, load a
//! snapshot, decide, then hand a single [`Commit`] to the store. The store
//! re-checks status, version and capacity at commit time, so a decision
//! made on a stale snapshot is refused rather than half-applied.

pub mod advisor;
mod assign;
pub mod filter;
mod lifecycle;
pub mod locks;
mod reassign;
pub mod result;

pub use advisor::{
    Advisor, AlgorithmicAdvisor, GenerativeAdvisor, Recommendation, RecommendationAdvisor,
    RecommendationRequest,
};
pub use filter::{Candidate, MAX_CANDIDATES, filter};
pub use locks::TaskLocks;
pub use reassign::ReassignOptions;
pub use result::{AssignmentResult, FailureKind, LifecycleResult, Method};

use std::sync::Arc;

use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::history::{HistoricalContext, HistorySource};
use crate::model::Task;
use crate::store::{Commit, Store};

use self::result::classify_commit_error;

/// Default number of similar past tasks fetched for the advisor.
const DEFAULT_HISTORY_TOP_K: usize = 5;

/// Entry point for all task state changes.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    advisor: Advisor,
    history: Option<Arc<dyn HistorySource>>,
    history_top_k: usize,
    clock: Arc<dyn Clock>,
    locks: TaskLocks,
}

impl Dispatcher {
    /// Algorithmic advisor, wall clock, no history source.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            advisor: Advisor::algorithmic(),
            history: None,
            history_top_k: DEFAULT_HISTORY_TOP_K,
            clock: Arc::new(SystemClock),
            locks: TaskLocks::new(),
        }
    }

    pub fn with_advisor(mut self, advisor: Advisor) -> Self {
        self.advisor = advisor;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySource>, top_k: usize) -> Self {
        self.history = Some(history);
        self.history_top_k = top_k;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Similar past tasks from the injected history source.
    ///
    /// Retrieval failures degrade to an empty context.
    pub async fn historical_context(&self, task: &Task) -> Option<HistoricalContext> {
        let source = self.history.as_ref()?;
        match source.retrieve_similar(task, self.history_top_k).await {
            Ok(similar) => Some(HistoricalContext::new(similar)),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "History retrieval failed, continuing without it");
                Some(HistoricalContext::default())
            }
        }
    }

    /// Commit, turning guard refusals into a typed failure.
    ///
    /// Outer `Err` is a persistence fault; inner `Err` is a refused commit.
    async fn finalize(
        &self,
        commit: &Commit,
    ) -> Result<Result<Task, (FailureKind, String)>, Error> {
        match self.store.commit(commit).await {
            Ok(task) => Ok(Ok(task)),
            Err(e) => {
                let (kind, reason) = classify_commit_error(e)?;
                warn!(task_id = %commit.task.id, kind = %kind, reason = %reason, "Commit refused");
                Ok(Err((kind, reason)))
            }
        }
    }
}

fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::error::{DatabaseError, RecommendationError};
    use crate::history::HistoricalOutcome;
    use crate::model::{TaskStatus, Worker};
    use crate::store::MemoryStore;

    struct FailingHistory;

    #[async_trait]
    impl HistorySource for FailingHistory {
        async fn retrieve_similar(
            &self,
            _task: &Task,
            _top_k: usize,
        ) -> Result<Vec<HistoricalOutcome>, DatabaseError> {
            Err(DatabaseError::Query("history store unreachable".into()))
        }
    }

    /// Records the history it was given, then ranks like the algorithmic advisor.
    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Option<HistoricalContext>>>,
    }

    #[async_trait]
    impl RecommendationAdvisor for Recording {
        fn method(&self) -> Method {
            Method::Generative
        }

        async fn recommend(
            &self,
            request: &RecommendationRequest<'_>,
        ) -> Result<Recommendation, RecommendationError> {
            self.seen.lock().unwrap().push(request.history.cloned());
            let mut rec = AlgorithmicAdvisor.recommend(request).await?;
            rec.method = Method::Generative;
            Ok(rec)
        }
    }

    #[tokio::test]
    async fn history_failure_degrades_to_empty_context() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_worker(&Worker::new("A", "a", 2).with_skill("go", 5))
            .await
            .unwrap();
        store
            .save_task(&Task::new("T", "t", Utc::now()).with_skill("go", 3))
            .await
            .unwrap();

        let advisor = Arc::new(Recording::default());
        let dispatcher = Dispatcher::new(store.clone())
            .with_advisor(Advisor::with_primary(advisor.clone()))
            .with_history(Arc::new(FailingHistory), 3);

        let task = store.get_task("T").await.unwrap().unwrap();
        assert_eq!(
            dispatcher.historical_context(&task).await,
            Some(HistoricalContext::default())
        );

        let result = dispatcher.assign("T", None).await.unwrap();
        assert_eq!(result.worker_id(), Some("A"));
        assert_eq!(
            advisor.seen.lock().unwrap().as_slice(),
            &[Some(HistoricalContext::default())]
        );

        let task = store.get_task("T").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.log[0].details.history_present, Some(false));
        assert_eq!(task.log[0].details.method.as_deref(), Some("generative"));
    }
}
