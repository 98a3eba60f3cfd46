//! Repository port for queue persistence, claiming and worker liveness.

use crate::queue::domain::{
    LogRecord, NewTask, Task, TaskDomainError, TaskFilter, TaskId, TaskLogEntry, TaskStatus,
    TagSet, TaskType, Worker, WorkerId,
};
use crate::queue::strategy::ClaimStrategy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Result type for queue repository operations.
pub type QueueRepositoryResult<T> = Result<T, QueueRepositoryError>;

/// Domain mutation applied to a loaded task inside a write transaction.
///
/// The closure may run more than once when the store retries a busy
/// transaction, so it must not have side effects outside the task.
pub type TaskMutation =
    Arc<dyn Fn(&mut Task) -> Result<MutationEffect, TaskDomainError> + Send + Sync>;

/// What a [`TaskMutation`] did to the task.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEffect {
    /// Nothing changed; nothing is written.
    Unchanged,
    /// The task changed without a lifecycle event (a lease renewal).
    Updated,
    /// The task changed and the record is appended to its log, stamped with
    /// the task's new `updated_at`.
    Logged(LogRecord),
}

/// Outcome of [`QueueRepository::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// The stored task; the pre-existing one when deduplicated.
    pub task: Task,
    /// `false` when the idempotency key matched an existing task.
    pub created: bool,
}

/// Outcome of [`QueueRepository::mutate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResult {
    /// The task after the mutation.
    pub task: Task,
    /// Whether the mutation changed and persisted the task.
    pub changed: bool,
}

/// Parameters of one claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Worker that will hold the lease.
    pub worker_id: WorkerId,
    /// Declared capabilities. `None` places no restriction on task tags.
    pub capabilities: Option<TagSet>,
    /// Restricts the claim to one task type.
    pub task_type: Option<TaskType>,
    /// Claim time; candidates need `run_after <= now`.
    pub now: DateTime<Utc>,
    /// Lease expiry written on the claimed task.
    pub lease_until: DateTime<Utc>,
}

/// A leased task whose lease is eligible for reclamation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredLease {
    /// The leased task.
    pub task_id: TaskId,
    /// The worker recorded as holding the lease.
    pub worker_id: WorkerId,
}

/// Raw aggregate counts reported by a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Task count per `(type, status)` pair that has at least one task.
    pub counts: Vec<(TaskType, TaskStatus, u64)>,
    /// Creation time of the oldest queued task.
    pub oldest_queued_at: Option<DateTime<Utc>>,
}

/// Rows removed by [`QueueRepository::prune`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Terminal tasks deleted.
    pub tasks_removed: u64,
    /// Log rows deleted, including those cascaded from deleted tasks.
    pub logs_removed: u64,
}

/// Queue persistence contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Inserts a task, or returns the existing one when its idempotency key
    /// is already present. Appends an `enqueued` log entry on insert.
    async fn enqueue(&self, task: NewTask) -> QueueRepositoryResult<Enqueued>;

    /// Finds a task by identifier.
    async fn find_by_id(&self, id: TaskId) -> QueueRepositoryResult<Option<Task>>;

    /// Lists tasks matching `filter`, ordered by id.
    async fn list(&self, filter: &TaskFilter) -> QueueRepositoryResult<Vec<Task>>;

    /// Loads a task, applies `mutation` and persists the result with its log
    /// entry, all in one write transaction.
    ///
    /// # Errors
    ///
    /// Returns [`QueueRepositoryError::NotFound`] for an unknown id and
    /// [`QueueRepositoryError::Domain`] when the mutation rejects the change.
    async fn mutate(
        &self,
        id: TaskId,
        mutation: TaskMutation,
    ) -> QueueRepositoryResult<MutationResult>;

    /// Atomically selects an eligible task with `strategy`, leases it to the
    /// requesting worker, appends a log entry and refreshes the worker's
    /// heartbeat. Returns `None` when nothing is eligible.
    async fn claim_next(
        &self,
        request: ClaimRequest,
        strategy: Arc<dyn ClaimStrategy>,
    ) -> QueueRepositoryResult<Option<Task>>;

    /// Returns leased tasks whose lease ended before `now` and whose worker
    /// is unknown, last heard from before `stale_before`, or whose lease
    /// ended before `orphan_before`.
    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        orphan_before: DateTime<Utc>,
    ) -> QueueRepositoryResult<Vec<ExpiredLease>>;

    /// Inserts or updates a worker. An existing worker keeps its
    /// registration time.
    async fn upsert_worker(&self, worker: Worker) -> QueueRepositoryResult<Worker>;

    /// Records a heartbeat for a known worker. Returns `false` when the
    /// worker is not registered.
    async fn touch_worker(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> QueueRepositoryResult<bool>;

    /// Finds a worker by identifier.
    async fn find_worker(&self, worker_id: &WorkerId) -> QueueRepositoryResult<Option<Worker>>;

    /// Returns the log entries of a task in write order.
    async fn task_logs(&self, id: TaskId) -> QueueRepositoryResult<Vec<TaskLogEntry>>;

    /// Returns aggregate counts.
    async fn stats(&self) -> QueueRepositoryResult<StoreStats>;

    /// Deletes terminal tasks finished before `before` and log rows written
    /// before `before`.
    async fn prune(&self, before: DateTime<Utc>) -> QueueRepositoryResult<PruneReport>;
}

/// Store housekeeping that sits outside the task lifecycle.
#[async_trait]
pub trait StorageMaintenance: Send + Sync {
    /// Flushes the write-ahead log into the main database file.
    async fn checkpoint(&self) -> QueueRepositoryResult<()>;

    /// Writes a consistent snapshot of the store to `destination`.
    ///
    /// # Errors
    ///
    /// Fails when `destination` already exists.
    async fn backup_to(&self, destination: &Path) -> QueueRepositoryResult<()>;

    /// File extension, without the dot, of the snapshots `backup_to` writes.
    fn backup_extension(&self) -> &'static str;
}

/// Errors returned by queue repository implementations.
#[derive(Debug, Clone, Error)]
pub enum QueueRepositoryError {
    /// The task was not found.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// A domain rule rejected the change.
    #[error(transparent)]
    Domain(#[from] TaskDomainError),

    /// The store stayed locked through every retry.
    #[error("store busy after {attempts} attempts")]
    Busy {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Persistence-layer failure.
    #[error("persistence error: {0}")]
    Persistence(Arc<dyn std::error::Error + Send + Sync>),
}

impl QueueRepositoryError {
    /// Wraps a persistence error.
    pub fn persistence(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Persistence(Arc::new(err))
    }
}
