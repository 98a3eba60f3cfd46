//! Single-worker poll loop with lease heartbeats.

use super::handler::TaskHandler;
use crate::config::PollConfig;
use crate::queue::domain::{TagSet, Task, TaskType, WorkerId};
use crate::queue::ports::QueueRepository;
use crate::queue::services::{
    Finalization, HeartbeatStatus, LeaseManager, Outcome, QueueError, QueueResult,
};
use mockable::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What happened to one claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The handler finished and its outcome was recorded.
    Finalized(Finalization),
    /// The worker stopped because the lease was lost or the task was
    /// cancelled.
    Abandoned,
}

/// Counts of task outcomes seen by one or more runners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerReport {
    /// Tasks completed.
    pub completed: u64,
    /// Attempts that failed and were requeued.
    pub requeued: u64,
    /// Tasks that failed terminally.
    pub failed: u64,
    /// Tasks abandoned after losing the lease or being cancelled.
    pub abandoned: u64,
}

impl RunnerReport {
    /// Counts one outcome.
    pub fn record(&mut self, outcome: RunOutcome) {
        let slot = match outcome {
            RunOutcome::Finalized(Finalization::Completed) => &mut self.completed,
            RunOutcome::Finalized(Finalization::Requeued { .. }) => &mut self.requeued,
            RunOutcome::Finalized(Finalization::Failed) => &mut self.failed,
            RunOutcome::Finalized(Finalization::Ignored) | RunOutcome::Abandoned => {
                &mut self.abandoned
            }
        };
        *slot = slot.saturating_add(1);
    }

    /// Adds another report's counts to this one.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            completed: self.completed.saturating_add(other.completed),
            requeued: self.requeued.saturating_add(other.requeued),
            failed: self.failed.saturating_add(other.failed),
            abandoned: self.abandoned.saturating_add(other.abandoned),
        }
    }

    /// Total tasks seen.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.completed
            .saturating_add(self.requeued)
            .saturating_add(self.failed)
            .saturating_add(self.abandoned)
    }
}

/// Claims tasks for one worker identity and runs them through a handler.
pub struct WorkerRunner<R, C, H>
where
    R: QueueRepository,
    C: Clock + Send + Sync,
    H: TaskHandler,
{
    leases: Arc<LeaseManager<R, C>>,
    handler: Arc<H>,
    worker_id: WorkerId,
    capabilities: Option<TagSet>,
    task_type: Option<TaskType>,
    poll: PollConfig,
    heartbeat_interval: Duration,
}

impl<R, C, H> WorkerRunner<R, C, H>
where
    R: QueueRepository,
    C: Clock + Send + Sync,
    H: TaskHandler,
{
    /// Creates a runner that claims any task, polls with the default
    /// intervals and heartbeats at the configured lease interval.
    #[must_use]
    pub fn new(leases: Arc<LeaseManager<R, C>>, handler: Arc<H>, worker_id: WorkerId) -> Self {
        let heartbeat_interval = leases.lease_config().heartbeat_interval();
        Self {
            leases,
            handler,
            worker_id,
            capabilities: None,
            task_type: None,
            poll: PollConfig::default(),
            heartbeat_interval,
        }
    }

    /// Restricts claims to tasks whose tags are a subset of `capabilities`.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: TagSet) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Restricts claims to one task type.
    #[must_use]
    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    /// Sets the idle polling intervals.
    #[must_use]
    pub const fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Sets how often a running task's lease is renewed.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Returns this runner's worker identity.
    #[must_use]
    pub const fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Registers the worker, then claims and runs tasks until `shutdown`
    /// turns `true` or its sender is dropped.
    ///
    /// Shutdown stops new claims; a task already running is allowed to
    /// finish. While the queue is empty the poll delay doubles from the
    /// minimum to the maximum interval and resets after every claim.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] only when registration fails; errors inside
    /// the loop are logged and retried.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> QueueResult<RunnerReport> {
        self.leases
            .register_worker(&self.worker_id, self.capabilities.clone().unwrap_or_default())
            .await?;

        let mut report = RunnerReport::default();
        let mut idle = self.poll.min_interval();
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(Some(outcome)) => {
                    report.record(outcome);
                    idle = self.poll.min_interval();
                    continue;
                }
                Ok(None) => {}
                Err(err) if err.is_transient() => {
                    debug!(worker_id = %self.worker_id, error = %err, "store busy while claiming");
                }
                Err(err) => {
                    warn!(worker_id = %self.worker_id, error = %err, "claim failed");
                }
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(idle) => {}
            }
            idle = idle.saturating_mul(2).min(self.poll.max_interval());
        }
        info!(
            worker_id = %self.worker_id,
            completed = report.completed,
            failed = report.failed,
            "worker stopped"
        );
        Ok(report)
    }

    /// Claims one task and runs it to an outcome. Returns `None` when
    /// nothing was eligible.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] when the claim or the final outcome cannot be
    /// recorded.
    pub async fn run_once(&self) -> QueueResult<Option<RunOutcome>> {
        let claimed = self
            .leases
            .claim_next(
                &self.worker_id,
                self.capabilities.as_ref(),
                self.task_type.as_ref(),
            )
            .await?;
        let Some(task) = claimed else {
            return Ok(None);
        };
        self.execute(&task).await.map(Some)
    }

    async fn execute(&self, task: &Task) -> QueueResult<RunOutcome> {
        let task_id = task.id();
        let work = self.handler.handle(task);
        tokio::pin!(work);

        let every = self.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut work => {
                    let outcome = match result {
                        Ok(payload) => Outcome::Success(payload),
                        Err(err) => Outcome::Failure {
                            error: err.message().to_owned(),
                            disposition: err.disposition(),
                        },
                    };
                    return match self.leases.finalize(task_id, &self.worker_id, outcome).await {
                        Ok(finalization) => Ok(RunOutcome::Finalized(finalization)),
                        Err(QueueError::LeaseLost { .. }) => {
                            warn!(task_id = %task_id, worker_id = %self.worker_id, "lease lost before outcome was recorded");
                            Ok(RunOutcome::Abandoned)
                        }
                        Err(err) => Err(err),
                    };
                }
                _ = heartbeat.tick() => {
                    match self.leases.heartbeat(task_id, &self.worker_id).await {
                        Ok(HeartbeatStatus::Renewed { .. }) => {}
                        Ok(HeartbeatStatus::Cancelled) => {
                            info!(task_id = %task_id, worker_id = %self.worker_id, "task cancelled, stopping handler");
                            return Ok(RunOutcome::Abandoned);
                        }
                        Err(QueueError::LeaseLost { .. }) => {
                            warn!(task_id = %task_id, worker_id = %self.worker_id, "lease lost, stopping handler");
                            return Ok(RunOutcome::Abandoned);
                        }
                        Err(err) => {
                            warn!(task_id = %task_id, worker_id = %self.worker_id, error = %err, "heartbeat failed");
                        }
                    }
                }
            }
        }
    }
}
