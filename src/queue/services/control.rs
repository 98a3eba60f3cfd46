//! Producer and operator operations: enqueue, inspect, cancel, list,
//! administrative status changes and statistics.

use super::error::{QueueError, QueueResult, now_millis};
use crate::queue::domain::{
    IdempotencyKey, LogLevel, LogRecord, NewTask, Priority, TagSet, Task, TaskFilter, TaskId,
    TaskDomainError, TaskLogEntry, TaskStatus, TaskType, TaskTypeRegistry, WorkerId, add_duration,
};
use crate::queue::metrics::QueueMetrics;
use crate::queue::ports::{Enqueued, MutationEffect, QueueRepository};
use chrono::{DateTime, Utc};
use mockable::Clock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Request to add a task to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    task_type: String,
    payload: Vec<u8>,
    priority: i32,
    tags: Vec<String>,
    max_attempts: Option<u32>,
    idempotency_key: Option<String>,
    delay: Option<Duration>,
}

impl EnqueueRequest {
    /// Creates a request with the required fields and default options.
    #[must_use]
    pub fn new(task_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
            priority: 0,
            tags: Vec::new(),
            max_attempts: None,
            idempotency_key: None,
            delay: None,
        }
    }

    /// Sets the priority; smaller runs first.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets compatibility tags written as `key=value`.
    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    /// Overrides the registry's default attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Sets a deduplication key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Defers the first run by `delay`.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueReceipt {
    /// Identifier of the stored task.
    pub task_id: TaskId,
    /// `false` when an existing task with the same idempotency key was
    /// returned instead.
    pub created: bool,
}

/// Status snapshot returned to producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatusView {
    /// Task identifier.
    pub task_id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Last failure, kept once the task fails.
    pub error_message: Option<String>,
    /// Worker holding the lease, if any.
    pub locked_by: Option<WorkerId>,
    /// Earliest time the task may be claimed.
    pub run_after: DateTime<Utc>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// Time the task reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskStatusView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id(),
            status: task.status(),
            attempts: task.attempts(),
            max_attempts: task.max_attempts(),
            error_message: task.error_message().map(str::to_owned),
            locked_by: task.locked_by().cloned(),
            run_after: task.run_after(),
            created_at: task.created_at(),
            updated_at: task.updated_at(),
            finished_at: task.finished_at(),
        }
    }
}

/// One row of a task listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    /// Task identifier.
    pub id: TaskId,
    /// Task type.
    pub task_type: TaskType,
    /// Priority.
    pub priority: Priority,
    /// Current status.
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Compatibility tags.
    pub tags: Vec<String>,
    /// Worker holding the lease, if any.
    pub locked_by: Option<WorkerId>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id(),
            task_type: task.task_type().clone(),
            priority: task.priority(),
            status: task.status(),
            attempts: task.attempts(),
            max_attempts: task.max_attempts(),
            tags: task.compatibility().to_strings(),
            locked_by: task.locked_by().cloned(),
            created_at: task.created_at(),
            updated_at: task.updated_at(),
        }
    }
}

/// Administrative status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    status: TaskStatus,
    error_message: Option<String>,
}

impl StatusUpdate {
    /// Targets `status`.
    #[must_use]
    pub const fn new(status: TaskStatus) -> Self {
        Self {
            status,
            error_message: None,
        }
    }

    /// Records a reason; kept as the error message when failing a task.
    #[must_use]
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Returns the target status.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        self.status
    }
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Total tasks in the store.
    pub total: u64,
    /// Count per status; every status is present.
    pub by_status: BTreeMap<TaskStatus, u64>,
    /// Count per task type.
    pub by_type: BTreeMap<TaskType, u64>,
    /// Count per `(type, status)` pair.
    pub by_type_status: Vec<(TaskType, TaskStatus, u64)>,
    /// Age of the oldest queued task.
    pub oldest_queued_age: Option<Duration>,
}

/// Queue control service used by producers and operators.
pub struct QueueService<R, C>
where
    R: QueueRepository,
    C: Clock + Send + Sync,
{
    repository: Arc<R>,
    clock: Arc<C>,
    registry: TaskTypeRegistry,
    metrics: Option<Arc<QueueMetrics>>,
}

impl<R, C> QueueService<R, C>
where
    R: QueueRepository,
    C: Clock + Send + Sync,
{
    /// Creates a service that accepts any task type with the default
    /// priority range.
    #[must_use]
    pub fn new(repository: Arc<R>, clock: Arc<C>) -> Self {
        Self {
            repository,
            clock,
            registry: TaskTypeRegistry::new(),
            metrics: None,
        }
    }

    /// Validates enqueues against `registry`.
    #[must_use]
    pub fn with_registry(mut self, registry: TaskTypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Reports transitions and gauges to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<QueueMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Adds a task, or returns the existing one for a repeated idempotency
    /// key.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Validation`] for an unknown type, an
    /// out-of-range priority, malformed tags or an unusable attempt budget;
    /// storage errors otherwise.
    pub async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<EnqueueReceipt> {
        let task_type = TaskType::new(request.task_type)?;
        self.registry.check_type(&task_type)?;
        let priority = Priority::new(request.priority);
        self.registry.check_priority(priority)?;
        let tags = TagSet::parse(&request.tags)?;
        let max_attempts = request
            .max_attempts
            .unwrap_or_else(|| self.registry.default_max_attempts());

        let now = now_millis(&*self.clock);
        let mut task = NewTask::new(task_type, request.payload, max_attempts, now)?
            .with_priority(priority)
            .with_compatibility(tags);
        if let Some(delay) = request.delay {
            task = task.with_run_after(add_duration(now, delay));
        }
        if let Some(key) = request.idempotency_key {
            task = task.with_idempotency_key(IdempotencyKey::new(key)?);
        }

        let Enqueued {
            task: stored,
            created,
        } = self.repository.enqueue(task).await?;
        if created {
            info!(
                task_id = %stored.id(),
                task_type = %stored.task_type(),
                priority = stored.priority().value(),
                "task enqueued"
            );
            self.record_transition(TaskStatus::Queued);
        } else {
            debug!(task_id = %stored.id(), "idempotency key matched existing task");
        }
        Ok(EnqueueReceipt {
            task_id: stored.id(),
            created,
        })
    }

    /// Returns a full task, payload and result included.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] for an unknown id.
    pub async fn get_task(&self, id: TaskId) -> QueueResult<Task> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or(QueueError::NotFound(id))
    }

    /// Returns the status snapshot of a task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] for an unknown id.
    pub async fn get_task_status(&self, id: TaskId) -> QueueResult<TaskStatusView> {
        let task = self.get_task(id).await?;
        Ok(TaskStatusView::from(&task))
    }

    /// Cancels a queued or leased task.
    ///
    /// Returns `false` when the task is already terminal. A worker holding
    /// the lease learns of the cancellation on its next heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] for an unknown id.
    pub async fn cancel_task(&self, id: TaskId) -> QueueResult<bool> {
        let now = now_millis(&*self.clock);
        let outcome = self
            .repository
            .mutate(
                id,
                Arc::new(move |task: &mut Task| -> Result<MutationEffect, TaskDomainError> {
                    let previous = task.status();
                    if !task.cancel(now) {
                        return Ok(MutationEffect::Unchanged);
                    }
                    Ok(MutationEffect::Logged(
                        LogRecord::new(LogLevel::Warn, "cancelled")
                            .with_details(serde_json::json!({ "from": previous.as_str() })),
                    ))
                }),
            )
            .await?;
        if outcome.changed {
            info!(task_id = %id, "task cancelled");
            self.record_transition(TaskStatus::Cancelled);
        }
        Ok(outcome.changed)
    }

    /// Lists tasks matching `filter`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> QueueResult<Vec<TaskSummary>> {
        let tasks = self.repository.list(filter).await?;
        Ok(tasks.iter().map(TaskSummary::from).collect())
    }

    /// Applies an operator status change.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Conflict`] when the state machine forbids the
    /// transition and [`QueueError::NotFound`] for an unknown id.
    pub async fn update_status(&self, id: TaskId, update: StatusUpdate) -> QueueResult<Task> {
        let now = now_millis(&*self.clock);
        let target = update.status;
        let reason = update.error_message;
        let outcome = self
            .repository
            .mutate(
                id,
                Arc::new(move |task: &mut Task| -> Result<MutationEffect, TaskDomainError> {
                    let previous = task.status();
                    task.transition_to(target, reason.as_deref(), now)?;
                    let level = if target == TaskStatus::Failed {
                        LogLevel::Error
                    } else {
                        LogLevel::Info
                    };
                    Ok(MutationEffect::Logged(
                        LogRecord::new(level, format!("status set to {target}")).with_details(
                            serde_json::json!({
                                "from": previous.as_str(),
                                "reason": reason,
                            }),
                        ),
                    ))
                }),
            )
            .await?;
        info!(task_id = %id, status = %target, "task status updated");
        self.record_transition(target);
        Ok(outcome.task)
    }

    /// Returns aggregate counts and refreshes the gauges when metrics are
    /// attached.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let raw = self.repository.stats().await?;
        let now = now_millis(&*self.clock);

        let mut stats = QueueStats {
            by_status: TaskStatus::ALL.iter().map(|status| (*status, 0)).collect(),
            oldest_queued_age: raw
                .oldest_queued_at
                .map(|created| (now - created).to_std().unwrap_or_default()),
            ..QueueStats::default()
        };
        for (task_type, status, count) in raw.counts {
            stats.total = stats.total.saturating_add(count);
            *stats.by_status.entry(status).or_default() += count;
            *stats.by_type.entry(task_type.clone()).or_default() += count;
            stats.by_type_status.push((task_type, status, count));
        }

        if let Some(metrics) = &self.metrics {
            metrics.update_from_stats(&stats);
        }
        Ok(stats)
    }

    /// Returns the audit log of a task in write order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] for an unknown id.
    pub async fn task_logs(&self, id: TaskId) -> QueueResult<Vec<TaskLogEntry>> {
        if self.repository.find_by_id(id).await?.is_none() {
            return Err(QueueError::NotFound(id));
        }
        Ok(self.repository.task_logs(id).await?)
    }

    fn record_transition(&self, status: TaskStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(status);
        }
    }
}
