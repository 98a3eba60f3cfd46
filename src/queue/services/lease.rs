//! Worker-facing lease operations: claim, heartbeat, finalise, reclaim.

use super::error::{QueueError, QueueResult, now_millis};
use super::retry::{Finalization, RetryController};
use crate::config::LeaseConfig;
use crate::queue::domain::{
    BackoffPolicy, FailureDisposition, TagSet, Task, TaskDomainError, TaskId, TaskStatus,
    TaskType, Worker, WorkerId, add_duration, sub_duration,
};
use crate::queue::metrics::{ClaimResult, QueueMetrics};
use crate::queue::ports::{ClaimRequest, MutationEffect, QueueRepository};
use crate::queue::strategy::ClaimStrategy;
use chrono::{DateTime, Utc};
use mockable::Clock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Reported outcome of a worker's work on a leased task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The handler succeeded, optionally producing a result payload.
    Success(Option<Vec<u8>>),
    /// The handler failed.
    Failure {
        /// Error text stored on the task if it fails terminally.
        error: String,
        /// Whether another attempt may succeed.
        disposition: FailureDisposition,
    },
}

impl Outcome {
    /// A retryable failure.
    #[must_use]
    pub fn retryable(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            disposition: FailureDisposition::Retryable,
        }
    }

    /// A failure that must not be retried.
    #[must_use]
    pub fn permanent(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            disposition: FailureDisposition::Permanent,
        }
    }
}

/// Result of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// The lease now runs until `lease_until`.
    Renewed {
        /// New lease expiry.
        lease_until: DateTime<Utc>,
    },
    /// An operator cancelled the task; the worker should stop.
    Cancelled,
}

/// Summary of one reclamation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Expired leases found.
    pub examined: usize,
    /// Tasks sent back through the failure path.
    pub reclaimed: Vec<TaskId>,
    /// Reclaimed tasks that spent their last attempt.
    pub failed: usize,
}

/// Coordinates leases between workers and the store.
pub struct LeaseManager<R, C>
where
    R: QueueRepository,
    C: Clock + Send + Sync,
{
    repository: Arc<R>,
    clock: Arc<C>,
    strategy: Arc<dyn ClaimStrategy>,
    lease: LeaseConfig,
    retry: RetryController<R, C>,
    metrics: Option<Arc<QueueMetrics>>,
}

impl<R, C> LeaseManager<R, C>
where
    R: QueueRepository,
    C: Clock + Send + Sync,
{
    /// Creates a lease manager.
    #[must_use]
    pub fn new(
        repository: Arc<R>,
        clock: Arc<C>,
        strategy: Arc<dyn ClaimStrategy>,
        lease: LeaseConfig,
        backoff: BackoffPolicy,
    ) -> Self {
        let retry = RetryController::new(Arc::clone(&repository), Arc::clone(&clock), backoff);
        Self {
            repository,
            clock,
            strategy,
            lease,
            retry,
            metrics: None,
        }
    }

    /// Reports claims, transitions and reclaims to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<QueueMetrics>) -> Self {
        self.retry = self.retry.with_metrics(Arc::clone(&metrics));
        self.metrics = Some(metrics);
        self
    }

    /// Returns the claim strategy.
    #[must_use]
    pub fn strategy(&self) -> &dyn ClaimStrategy {
        self.strategy.as_ref()
    }

    /// Returns the lease timing.
    #[must_use]
    pub const fn lease_config(&self) -> &LeaseConfig {
        &self.lease
    }

    /// Registers a worker or refreshes its capabilities and heartbeat.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn register_worker(
        &self,
        worker_id: &WorkerId,
        capabilities: TagSet,
    ) -> QueueResult<Worker> {
        let now = now_millis(&*self.clock);
        let worker = self
            .repository
            .upsert_worker(Worker::new(worker_id.clone(), capabilities, now))
            .await?;
        info!(worker_id = %worker_id, capabilities = %worker.capabilities(), "worker registered");
        Ok(worker)
    }

    /// Leases the next eligible task to `worker_id`, or returns `None`.
    ///
    /// `capabilities` of `None` places no restriction on task tags.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::TransientStore`] when the store stays locked.
    pub async fn claim_next(
        &self,
        worker_id: &WorkerId,
        capabilities: Option<&TagSet>,
        task_type: Option<&TaskType>,
    ) -> QueueResult<Option<Task>> {
        let now = now_millis(&*self.clock);
        let request = ClaimRequest {
            worker_id: worker_id.clone(),
            capabilities: capabilities.cloned(),
            task_type: task_type.cloned(),
            now,
            lease_until: add_duration(now, self.lease.duration()),
        };

        let started = Instant::now();
        let claimed = self
            .repository
            .claim_next(request, Arc::clone(&self.strategy))
            .await;
        let result = match &claimed {
            Ok(Some(_)) => ClaimResult::Claimed,
            Ok(None) => ClaimResult::Empty,
            Err(_) => ClaimResult::Error,
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_claim(self.strategy.name(), result, started.elapsed());
            if result == ClaimResult::Claimed {
                metrics.record_transition(TaskStatus::Leased);
            }
        }

        let task = claimed?;
        if let Some(leased) = &task {
            info!(
                task_id = %leased.id(),
                worker_id = %worker_id,
                task_type = %leased.task_type(),
                attempts = leased.attempts(),
                strategy = self.strategy.name(),
                "task claimed"
            );
        }
        Ok(task)
    }

    /// Extends the lease held by `worker_id` and records the worker's
    /// heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LeaseLost`] when another worker holds the task
    /// or it is no longer leased.
    pub async fn heartbeat(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
    ) -> QueueResult<HeartbeatStatus> {
        let now = now_millis(&*self.clock);
        let lease_until = add_duration(now, self.lease.duration());
        let worker = worker_id.clone();
        let outcome = self
            .repository
            .mutate(
                task_id,
                Arc::new(move |task: &mut Task| -> Result<MutationEffect, TaskDomainError> {
                    if task.status() == TaskStatus::Cancelled {
                        return Ok(MutationEffect::Unchanged);
                    }
                    task.renew_lease(&worker, lease_until, now)?;
                    Ok(MutationEffect::Updated)
                }),
            )
            .await?;
        self.repository.touch_worker(worker_id, now).await?;

        if outcome.task.status() == TaskStatus::Cancelled {
            info!(task_id = %task_id, worker_id = %worker_id, "heartbeat found task cancelled");
            return Ok(HeartbeatStatus::Cancelled);
        }
        let renewed_until = outcome
            .task
            .lease()
            .map_or(lease_until, |lease| lease.lease_until());
        debug!(task_id = %task_id, worker_id = %worker_id, lease_until = %renewed_until, "lease renewed");
        Ok(HeartbeatStatus::Renewed {
            lease_until: renewed_until,
        })
    }

    /// Applies a worker's reported outcome.
    ///
    /// A task cancelled while its handler ran is left cancelled and
    /// [`Finalization::Ignored`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LeaseLost`] when `worker_id` no longer holds
    /// the lease.
    pub async fn finalize(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        outcome: Outcome,
    ) -> QueueResult<Finalization> {
        match outcome {
            Outcome::Success(result) => self.retry.succeed(task_id, worker_id, result).await,
            Outcome::Failure { error, disposition } => {
                self.retry
                    .fail(task_id, worker_id, &error, disposition)
                    .await
            }
        }
    }

    /// Sends every expired lease whose worker is unknown, stale or past the
    /// orphan grace period through the failure path.
    ///
    /// A lease that disappears or is renewed between detection and
    /// reclamation is skipped.
    ///
    /// # Errors
    ///
    /// Returns storage errors raised while listing leases. Errors on
    /// individual tasks are logged and skipped.
    pub async fn reclaim_expired_leases(&self) -> QueueResult<ReclaimReport> {
        let now = now_millis(&*self.clock);
        let stale_before = sub_duration(now, self.lease.heartbeat_staleness());
        let orphan_before = sub_duration(now, self.lease.orphan_grace());
        let expired = self
            .repository
            .expired_leases(now, stale_before, orphan_before)
            .await?;

        let mut report = ReclaimReport {
            examined: expired.len(),
            ..ReclaimReport::default()
        };
        for lease in &expired {
            match self.retry.fail_abandoned(lease).await {
                Ok(Some(finalization)) => {
                    report.reclaimed.push(lease.task_id);
                    if finalization == Finalization::Failed {
                        report.failed = report.failed.saturating_add(1);
                    }
                }
                Ok(None) | Err(QueueError::NotFound(_)) => {
                    debug!(task_id = %lease.task_id, "lease no longer reclaimable");
                }
                Err(err) => {
                    warn!(task_id = %lease.task_id, error = %err, "failed to reclaim lease");
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_reclaimed(u64::try_from(report.reclaimed.len()).unwrap_or(u64::MAX));
        }
        if !report.reclaimed.is_empty() {
            info!(
                examined = report.examined,
                reclaimed = report.reclaimed.len(),
                failed = report.failed,
                "expired leases reclaimed"
            );
        }
        Ok(report)
    }
}
