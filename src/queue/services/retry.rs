//! Completion and failure handling for leased tasks.

use super::error::{QueueResult, now_millis};
use crate::queue::domain::{
    BackoffPolicy, FailureDisposition, FailureOutcome, LogLevel, LogRecord, Task, TaskDomainError,
    TaskId, TaskStatus, WorkerId,
};
use crate::queue::metrics::QueueMetrics;
use crate::queue::ports::{ExpiredLease, MutationEffect, QueueRepository};
use chrono::{DateTime, Utc};
use mockable::Clock;
use std::sync::Arc;
use tracing::{info, warn};

/// What finalising a leased task did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    /// The task completed.
    Completed,
    /// The attempt failed and the task waits for its next run.
    Requeued {
        /// Earliest time of the next attempt.
        run_after: DateTime<Utc>,
    },
    /// The attempt budget is spent; the task failed.
    Failed,
    /// The task was cancelled while running; nothing changed.
    Ignored,
}

/// Applies success and failure outcomes, scheduling retries with a
/// [`BackoffPolicy`].
pub struct RetryController<R, C>
where
    R: QueueRepository,
    C: Clock + Send + Sync,
{
    repository: Arc<R>,
    clock: Arc<C>,
    backoff: BackoffPolicy,
    metrics: Option<Arc<QueueMetrics>>,
}

impl<R, C> RetryController<R, C>
where
    R: QueueRepository,
    C: Clock + Send + Sync,
{
    /// Creates a controller with the given retry backoff.
    #[must_use]
    pub const fn new(repository: Arc<R>, clock: Arc<C>, backoff: BackoffPolicy) -> Self {
        Self {
            repository,
            clock,
            backoff,
            metrics: None,
        }
    }

    /// Reports transitions to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<QueueMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the retry backoff.
    #[must_use]
    pub const fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Completes a task on behalf of the lease holder.
    ///
    /// # Errors
    ///
    /// Returns [`super::QueueError::LeaseLost`] when `worker_id` no longer
    /// holds the lease.
    pub async fn succeed(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        result: Option<Vec<u8>>,
    ) -> QueueResult<Finalization> {
        let now = now_millis(&*self.clock);
        let worker = worker_id.clone();
        let outcome = self
            .repository
            .mutate(
                task_id,
                Arc::new(move |task: &mut Task| -> Result<MutationEffect, TaskDomainError> {
                    if task.status() == TaskStatus::Cancelled {
                        return Ok(MutationEffect::Unchanged);
                    }
                    task.complete(&worker, result.clone(), now)?;
                    Ok(MutationEffect::Logged(
                        LogRecord::info("completed").with_details(serde_json::json!({
                            "worker_id": worker.as_str(),
                            "attempts": task.attempts(),
                        })),
                    ))
                }),
            )
            .await?;
        if !outcome.changed {
            info!(task_id = %task_id, worker_id = %worker_id, "task was cancelled while running");
            return Ok(Finalization::Ignored);
        }
        info!(
            task_id = %task_id,
            worker_id = %worker_id,
            task_type = %outcome.task.task_type(),
            attempts = outcome.task.attempts(),
            "task completed"
        );
        self.record_transition(TaskStatus::Completed);
        Ok(Finalization::Completed)
    }

    /// Records a failed attempt by the lease holder. The task is requeued
    /// with backoff, or failed once its attempt budget is spent.
    ///
    /// # Errors
    ///
    /// Returns [`super::QueueError::LeaseLost`] when `worker_id` no longer
    /// holds the lease.
    pub async fn fail(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        error: &str,
        disposition: FailureDisposition,
    ) -> QueueResult<Finalization> {
        let now = now_millis(&*self.clock);
        let worker = worker_id.clone();
        let message = error.to_owned();
        let backoff = self.backoff;
        let outcome = self
            .repository
            .mutate(
                task_id,
                Arc::new(move |task: &mut Task| -> Result<MutationEffect, TaskDomainError> {
                    if task.status() == TaskStatus::Cancelled {
                        return Ok(MutationEffect::Unchanged);
                    }
                    let failure = task.fail_attempt(&worker, &message, disposition, &backoff, now)?;
                    Ok(MutationEffect::Logged(failure_record(
                        task, failure, &worker, &message,
                    )))
                }),
            )
            .await?;
        if !outcome.changed {
            info!(task_id = %task_id, worker_id = %worker_id, "task was cancelled while running");
            return Ok(Finalization::Ignored);
        }
        let finalization = finalization_of(&outcome.task);
        self.report_failure(&outcome.task, worker_id, finalization);
        Ok(finalization)
    }

    /// Sends a task whose lease expired back through the failure path.
    ///
    /// Returns `None` when the task is no longer held by the recorded worker
    /// or its lease was renewed in the meantime.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn fail_abandoned(&self, lease: &ExpiredLease) -> QueueResult<Option<Finalization>> {
        let now = now_millis(&*self.clock);
        let worker = lease.worker_id.clone();
        let backoff = self.backoff;
        let outcome = self
            .repository
            .mutate(
                lease.task_id,
                Arc::new(move |task: &mut Task| -> Result<MutationEffect, TaskDomainError> {
                    if !task.is_leased_by(&worker) || !task.lease_expired(now) {
                        return Ok(MutationEffect::Unchanged);
                    }
                    let message = format!("lease held by {worker} expired");
                    let failure = task.fail_attempt(
                        &worker,
                        &message,
                        FailureDisposition::Retryable,
                        &backoff,
                        now,
                    )?;
                    Ok(MutationEffect::Logged(failure_record(
                        task, failure, &worker, &message,
                    )))
                }),
            )
            .await?;
        if !outcome.changed {
            return Ok(None);
        }
        let finalization = finalization_of(&outcome.task);
        warn!(
            task_id = %lease.task_id,
            worker_id = %lease.worker_id,
            attempts = outcome.task.attempts(),
            "reclaimed expired lease"
        );
        self.report_failure(&outcome.task, &lease.worker_id, finalization);
        Ok(Some(finalization))
    }

    fn report_failure(&self, task: &Task, worker_id: &WorkerId, finalization: Finalization) {
        match finalization {
            Finalization::Requeued { run_after } => {
                warn!(
                    task_id = %task.id(),
                    worker_id = %worker_id,
                    task_type = %task.task_type(),
                    attempts = task.attempts(),
                    %run_after,
                    "attempt failed, retry scheduled"
                );
                self.record_transition(TaskStatus::Queued);
            }
            Finalization::Failed => {
                warn!(
                    task_id = %task.id(),
                    worker_id = %worker_id,
                    task_type = %task.task_type(),
                    attempts = task.attempts(),
                    error = task.error_message().unwrap_or_default(),
                    "task failed"
                );
                self.record_transition(TaskStatus::Failed);
            }
            Finalization::Completed | Finalization::Ignored => {}
        }
    }

    fn record_transition(&self, status: TaskStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(status);
        }
    }
}

fn finalization_of(task: &Task) -> Finalization {
    if task.status() == TaskStatus::Failed {
        Finalization::Failed
    } else {
        Finalization::Requeued {
            run_after: task.run_after(),
        }
    }
}

fn failure_record(
    task: &Task,
    failure: FailureOutcome,
    worker_id: &WorkerId,
    error: &str,
) -> LogRecord {
    match failure {
        FailureOutcome::Requeued { run_after } => LogRecord::new(LogLevel::Warn, "retry scheduled")
            .with_details(serde_json::json!({
                "worker_id": worker_id.as_str(),
                "attempt": task.attempts(),
                "run_after": run_after,
                "error": error,
            })),
        FailureOutcome::Failed => {
            LogRecord::new(LogLevel::Error, "failed").with_details(serde_json::json!({
                "worker_id": worker_id.as_str(),
                "attempts": task.attempts(),
                "error": task.error_message(),
            }))
        }
    }
}
