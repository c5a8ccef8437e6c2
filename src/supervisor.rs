//! Periodic sweep that drives tasks toward a consistent state.
//!
//! Each cycle:
//! 1. Fails in-progress tasks that are past `due_at + overdue_grace`
//! 2. Assigns every pending task
//! 3. Reassigns in-progress tasks due within the at-risk horizon, unless
//!    they were reassigned inside the cooldown window
//!
//! Only one cycle runs at a time; a trigger that arrives while a cycle is
//! running is dropped. Shutdown is observed between tasks, so a task is
//! never left half-updated.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::dispatch::{AssignmentResult, Dispatcher, LifecycleResult, ReassignOptions};
use crate::error::Error;
use crate::model::{Task, TaskStatus};
use crate::store::TaskQuery;

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub failed_overdue: usize,
    pub assigned: usize,
    pub reassigned: usize,
    pub skipped_cooldown: usize,
    /// Typed failures (no candidates, capacity, ...).
    pub failures: usize,
    /// Persistence faults.
    pub errors: usize,
    /// Shutdown was requested before the sweep finished.
    pub cancelled: bool,
}

impl SweepReport {
    fn record_error(&mut self, task_id: &str, stage: &str, e: &Error) {
        error!(task_id = %task_id, stage, error = %e, "Sweep step failed");
        self.errors += 1;
    }
}

pub struct Supervisor {
    dispatcher: Arc<Dispatcher>,
    config: SupervisorConfig,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Clears the running flag when a cycle ends, including on drop.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Supervisor {
    pub fn new(dispatcher: Arc<Dispatcher>, config: SupervisorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            dispatcher,
            config,
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the background loop and any in-flight sweep to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run one sweep now. Returns `None` if a sweep is already running.
    pub async fn run_cycle(&self) -> Option<SweepReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sweep already running, trigger dropped");
            return None;
        }
        let _running = RunningGuard(&self.running);

        let mut report = SweepReport::default();
        let now = self.dispatcher.clock().now();
        let store = self.dispatcher.store();

        // 1. Overdue failures
        let overdue_before = now - self.config.overdue_grace;
        match store
            .query_tasks(&TaskQuery::status(TaskStatus::InProgress).due_before(overdue_before))
            .await
        {
            Ok(tasks) => {
                for task in tasks {
                    if self.shutdown_requested() {
                        return Some(self.cancelled(report));
                    }
                    match self.dispatcher.fail_overdue(&task.id).await {
                        Ok(LifecycleResult::Success { .. }) => {
                            warn!(task_id = %task.id, due_at = %task.due_at, "Task failed as overdue");
                            report.failed_overdue += 1;
                        }
                        Ok(LifecycleResult::Failure { kind, reason, .. }) => {
                            debug!(task_id = %task.id, kind = %kind, reason = %reason, "Overdue failure skipped");
                            report.failures += 1;
                        }
                        Err(e) => report.record_error(&task.id, "overdue", &e),
                    }
                }
            }
            Err(e) => report.record_error("-", "overdue", &e.into()),
        }

        // 2. Pending tasks
        match store.query_tasks(&TaskQuery::status(TaskStatus::Pending)).await {
            Ok(tasks) => {
                for task in tasks {
                    if self.shutdown_requested() {
                        return Some(self.cancelled(report));
                    }
                    match self.dispatcher.assign(&task.id, None).await {
                        Ok(AssignmentResult::Success { .. }) => report.assigned += 1,
                        Ok(AssignmentResult::Failure { kind, reason, .. }) => {
                            info!(task_id = %task.id, kind = %kind, reason = %reason, "Pending task not assigned");
                            report.failures += 1;
                        }
                        Err(e) => report.record_error(&task.id, "assign", &e),
                    }
                }
            }
            Err(e) => report.record_error("-", "assign", &e.into()),
        }

        // 3. At-risk tasks
        let horizon = now + self.config.at_risk_horizon;
        match store
            .query_tasks(&TaskQuery::status(TaskStatus::InProgress).due_before(horizon))
            .await
        {
            Ok(tasks) => {
                for task in tasks {
                    if self.shutdown_requested() {
                        return Some(self.cancelled(report));
                    }
                    self.reassign_at_risk(&task, now, &mut report).await;
                }
            }
            Err(e) => report.record_error("-", "reassign", &e.into()),
        }

        info!(
            failed_overdue = report.failed_overdue,
            assigned = report.assigned,
            reassigned = report.reassigned,
            skipped_cooldown = report.skipped_cooldown,
            failures = report.failures,
            errors = report.errors,
            "Sweep complete"
        );
        Some(report)
    }

    async fn reassign_at_risk(
        &self,
        task: &Task,
        now: chrono::DateTime<chrono::Utc>,
        report: &mut SweepReport,
    ) {
        if task.in_reassign_cooldown(now, self.config.reassign_cooldown) {
            debug!(task_id = %task.id, "Reassigned recently, skipping");
            report.skipped_cooldown += 1;
            return;
        }

        let mut options = ReassignOptions::default();
        if let Some(history) = self.dispatcher.historical_context(task).await {
            options = options.with_history(history);
        }
        match self.dispatcher.reassign(&task.id, options).await {
            Ok(AssignmentResult::Success { worker_id, .. }) => {
                info!(task_id = %task.id, worker_id = %worker_id, due_at = %task.due_at, "At-risk task reassigned");
                report.reassigned += 1;
            }
            Ok(AssignmentResult::Failure { kind, reason, .. }) => {
                info!(task_id = %task.id, kind = %kind, reason = %reason, "At-risk task not reassigned");
                report.failures += 1;
            }
            Err(e) => report.record_error(&task.id, "reassign", &e),
        }
    }

    fn cancelled(&self, mut report: SweepReport) -> SweepReport {
        info!("Sweep cancelled by shutdown");
        report.cancelled = true;
        report
    }

    /// Spawn the periodic loop. The first sweep runs immediately.
    pub fn start(self: Arc<Self>) -> SupervisorHandle {
        let supervisor = Arc::clone(&self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.interval;

        let handle = tokio::spawn(async move {
            info!("Supervisor started, sweeping every {}s", interval.as_secs());

            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => {}
                }

                if *shutdown.borrow() {
                    info!("Supervisor shutting down");
                    return;
                }

                supervisor.run_cycle().await;
            }
        });

        SupervisorHandle {
            supervisor: self,
            handle,
        }
    }
}

/// Handle to a running supervisor loop.
pub struct SupervisorHandle {
    supervisor: Arc<Supervisor>,
    handle: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Signal shutdown without waiting. An in-flight sweep stops at the
    /// next task boundary.
    pub fn cancel(&self) {
        self.supervisor.request_shutdown();
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(self) {
        self.supervisor.request_shutdown();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Supervisor task ended abnormally");
        }
    }
}
