//! Task aggregate root and the lifecycle transitions it permits.

use super::{
    BackoffPolicy, IdempotencyKey, Priority, TagSet, TaskDomainError, TaskId, TaskStatus,
    TaskType, WorkerId,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_ERROR_MESSAGE_CHARS: usize = 4096;

/// Exclusive, time-bounded claim a worker holds on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    worker_id: WorkerId,
    lease_until: DateTime<Utc>,
    reserved_at: DateTime<Utc>,
}

impl Lease {
    /// Creates a lease record.
    #[must_use]
    pub const fn new(
        worker_id: WorkerId,
        lease_until: DateTime<Utc>,
        reserved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            worker_id,
            lease_until,
            reserved_at,
        }
    }

    /// Returns the worker holding the lease.
    #[must_use]
    pub const fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Returns the instant after which the lease is considered abandoned.
    #[must_use]
    pub const fn lease_until(&self) -> DateTime<Utc> {
        self.lease_until
    }

    /// Returns when the task was claimed.
    #[must_use]
    pub const fn reserved_at(&self) -> DateTime<Utc> {
        self.reserved_at
    }
}

/// How a worker classifies a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDisposition {
    /// The attempt may be retried after backoff.
    Retryable,
    /// Retrying cannot help; the remaining attempt budget is consumed.
    Permanent,
}

/// What a recorded failure did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The task went back to `queued` and becomes eligible at `run_after`.
    Requeued {
        /// Earliest time the task may be claimed again.
        run_after: DateTime<Utc>,
    },
    /// The attempt budget is exhausted and the task is terminally failed.
    Failed,
}

/// Largest attempt budget a task may carry; stores keep counters as 32-bit
/// signed integers.
pub const MAX_ATTEMPTS_LIMIT: u32 = i32::MAX.unsigned_abs();

/// Validated request to create a task; the store assigns the identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    task_type: TaskType,
    priority: Priority,
    payload: Vec<u8>,
    compatibility: TagSet,
    max_attempts: u32,
    run_after: DateTime<Utc>,
    idempotency_key: Option<IdempotencyKey>,
    created_at: DateTime<Utc>,
}

impl NewTask {
    /// Creates a task definition eligible to run immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::InvalidMaxAttempts`] when `max_attempts` is
    /// zero or above [`MAX_ATTEMPTS_LIMIT`].
    pub fn new(
        task_type: TaskType,
        payload: Vec<u8>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, TaskDomainError> {
        if max_attempts == 0 || max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(TaskDomainError::InvalidMaxAttempts(max_attempts));
        }
        Ok(Self {
            task_type,
            priority: Priority::default(),
            payload,
            compatibility: TagSet::new(),
            max_attempts,
            run_after: now,
            idempotency_key: None,
            created_at: now,
        })
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the compatibility requirements.
    #[must_use]
    pub fn with_compatibility(mut self, compatibility: TagSet) -> Self {
        self.compatibility = compatibility;
        self
    }

    /// Delays eligibility until `run_after`. Earlier instants are clamped to
    /// the creation time.
    #[must_use]
    pub fn with_run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = run_after.max(self.created_at);
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    /// Returns the task type.
    #[must_use]
    pub const fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// Returns the priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns the opaque payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the compatibility requirements.
    #[must_use]
    pub const fn compatibility(&self) -> &TagSet {
        &self.compatibility
    }

    /// Returns the attempt budget.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the earliest eligible time.
    #[must_use]
    pub const fn run_after(&self) -> DateTime<Utc> {
        self.run_after
    }

    /// Returns the idempotency key, if any.
    #[must_use]
    pub const fn idempotency_key(&self) -> Option<&IdempotencyKey> {
        self.idempotency_key.as_ref()
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Materialises the task once the store has assigned its identifier.
    #[must_use]
    pub fn into_task(self, id: TaskId) -> Task {
        Task {
            id,
            task_type: self.task_type,
            priority: self.priority,
            payload: self.payload,
            compatibility: self.compatibility,
            status: TaskStatus::Queued,
            attempts: 0,
            max_attempts: self.max_attempts,
            run_after: self.run_after,
            lease: None,
            idempotency_key: self.idempotency_key,
            error_message: None,
            result: None,
            created_at: self.created_at,
            updated_at: self.created_at,
            finished_at: None,
        }
    }
}

/// Task aggregate root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    task_type: TaskType,
    priority: Priority,
    payload: Vec<u8>,
    compatibility: TagSet,
    status: TaskStatus,
    attempts: u32,
    max_attempts: u32,
    run_after: DateTime<Utc>,
    lease: Option<Lease>,
    idempotency_key: Option<IdempotencyKey>,
    error_message: Option<String>,
    result: Option<Vec<u8>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

/// Parameter object for reconstructing a persisted task aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedTaskData {
    /// Persisted task identifier.
    pub id: TaskId,
    /// Persisted routing type.
    pub task_type: TaskType,
    /// Persisted priority.
    pub priority: Priority,
    /// Persisted opaque payload.
    pub payload: Vec<u8>,
    /// Persisted compatibility requirements.
    pub compatibility: TagSet,
    /// Persisted lifecycle status.
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Earliest eligible time.
    pub run_after: DateTime<Utc>,
    /// Active lease, present only while leased.
    pub lease: Option<Lease>,
    /// Persisted idempotency key, if any.
    pub idempotency_key: Option<IdempotencyKey>,
    /// Terminal failure reason, if failed.
    pub error_message: Option<String>,
    /// Opaque result stored on success.
    pub result: Option<Vec<u8>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Latest lifecycle timestamp.
    pub updated_at: DateTime<Utc>,
    /// When the task entered a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Reconstructs a task from persisted storage.
    #[must_use]
    pub fn from_persisted(data: PersistedTaskData) -> Self {
        Self {
            id: data.id,
            task_type: data.task_type,
            priority: data.priority,
            payload: data.payload,
            compatibility: data.compatibility,
            status: data.status,
            attempts: data.attempts,
            max_attempts: data.max_attempts,
            run_after: data.run_after,
            lease: data.lease,
            idempotency_key: data.idempotency_key,
            error_message: data.error_message,
            result: data.result,
            created_at: data.created_at,
            updated_at: data.updated_at,
            finished_at: data.finished_at,
        }
    }

    /// Returns the task identifier.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the routing type.
    #[must_use]
    pub const fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// Returns the priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns the opaque payload, byte-identical to what was enqueued.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the compatibility requirements.
    #[must_use]
    pub const fn compatibility(&self) -> &TagSet {
        &self.compatibility
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        self.status
    }

    /// Returns the number of failed attempts.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the attempt budget.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the earliest eligible time.
    #[must_use]
    pub const fn run_after(&self) -> DateTime<Utc> {
        self.run_after
    }

    /// Returns the active lease, if any.
    #[must_use]
    pub const fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Returns the worker holding the lease, if any.
    #[must_use]
    pub fn locked_by(&self) -> Option<&WorkerId> {
        self.lease.as_ref().map(Lease::worker_id)
    }

    /// Returns the idempotency key, if any.
    #[must_use]
    pub const fn idempotency_key(&self) -> Option<&IdempotencyKey> {
        self.idempotency_key.as_ref()
    }

    /// Returns the terminal failure reason, if failed.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Returns the stored success result, if any.
    #[must_use]
    pub fn result(&self) -> Option<&[u8]> {
        self.result.as_deref()
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the latest lifecycle timestamp.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns when the task reached a terminal state.
    #[must_use]
    pub const fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Returns whether the task may be claimed at `now`.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Queued && self.run_after <= now
    }

    /// Returns whether `worker_id` currently holds the lease.
    #[must_use]
    pub fn is_leased_by(&self, worker_id: &WorkerId) -> bool {
        self.status == TaskStatus::Leased && self.locked_by() == Some(worker_id)
    }

    /// Returns whether the task is leased and its lease ran out before `now`.
    #[must_use]
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Leased
            && self.lease.as_ref().is_some_and(|lease| lease.lease_until < now)
    }

    /// Leases the task to `worker_id` until `lease_until`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::InvalidStateTransition`] when the task is
    /// not queued, or [`TaskDomainError::NotYetEligible`] when `run_after`
    /// has not been reached.
    pub fn lease_to(
        &mut self,
        worker_id: WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), TaskDomainError> {
        if self.status == TaskStatus::Queued && self.run_after > now {
            return Err(TaskDomainError::NotYetEligible(self.id));
        }
        self.set_status(TaskStatus::Leased, now)?;
        self.lease = Some(Lease::new(worker_id, lease_until, now));
        Ok(())
    }

    /// Extends the lease held by `worker_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::LeaseLost`] when `worker_id` does not hold
    /// the lease.
    pub fn renew_lease(
        &mut self,
        worker_id: &WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), TaskDomainError> {
        self.ensure_held_by(worker_id)?;
        if let Some(lease) = self.lease.as_mut() {
            lease.lease_until = lease_until.max(lease.lease_until);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Marks the task completed on behalf of the lease holder.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::LeaseLost`] when `worker_id` does not hold
    /// the lease.
    pub fn complete(
        &mut self,
        worker_id: &WorkerId,
        result: Option<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<(), TaskDomainError> {
        self.ensure_held_by(worker_id)?;
        self.set_status(TaskStatus::Completed, now)?;
        self.result = result;
        Ok(())
    }

    /// Records a failed attempt by the lease holder and decides whether the
    /// task is retried or terminally failed.
    ///
    /// `attempts` never exceeds `max_attempts`; the task fails exactly when
    /// the two become equal.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::LeaseLost`] when `worker_id` does not hold
    /// the lease.
    pub fn fail_attempt(
        &mut self,
        worker_id: &WorkerId,
        error: &str,
        disposition: FailureDisposition,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TaskDomainError> {
        self.ensure_held_by(worker_id)?;
        self.attempts = match disposition {
            FailureDisposition::Retryable => self.attempts.saturating_add(1),
            FailureDisposition::Permanent => self.max_attempts,
        }
        .min(self.max_attempts);

        if self.attempts >= self.max_attempts {
            self.set_status(TaskStatus::Failed, now)?;
            self.error_message = Some(truncate_error(error));
            return Ok(FailureOutcome::Failed);
        }

        self.set_status(TaskStatus::Queued, now)?;
        self.run_after = add_duration(now, backoff.delay(self.attempts));
        Ok(FailureOutcome::Requeued {
            run_after: self.run_after,
        })
    }

    /// Cancels a queued or leased task.
    ///
    /// Returns `false` without changing anything when the task is already
    /// terminal.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        self.set_status(TaskStatus::Cancelled, now).is_ok()
    }

    /// Applies an operator-requested status change.
    ///
    /// Leasing is only possible through a claim. Moving to `failed` consumes
    /// the remaining attempt budget so the attempt invariant holds.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::InvalidStateTransition`] when the state
    /// machine forbids the transition.
    pub fn transition_to(
        &mut self,
        target: TaskStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), TaskDomainError> {
        if target == TaskStatus::Leased {
            return Err(TaskDomainError::InvalidStateTransition {
                task_id: self.id,
                from: self.status,
                to: target,
            });
        }
        self.set_status(target, now)?;
        match target {
            TaskStatus::Queued => self.run_after = now,
            TaskStatus::Failed => {
                self.attempts = self.max_attempts;
                self.error_message = Some(truncate_error(
                    error_message.unwrap_or("failed by operator"),
                ));
            }
            TaskStatus::Leased | TaskStatus::Completed | TaskStatus::Cancelled => {}
        }
        Ok(())
    }

    fn ensure_held_by(&self, worker_id: &WorkerId) -> Result<(), TaskDomainError> {
        if self.is_leased_by(worker_id) {
            return Ok(());
        }
        Err(TaskDomainError::LeaseLost {
            task_id: self.id,
            worker_id: worker_id.clone(),
        })
    }

    /// Validates and applies a status change, keeping the lease and
    /// `finished_at` consistent with the new status.
    fn set_status(&mut self, target: TaskStatus, now: DateTime<Utc>) -> Result<(), TaskDomainError> {
        if !self.status.can_transition_to(target) {
            return Err(TaskDomainError::InvalidStateTransition {
                task_id: self.id,
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        if target != TaskStatus::Leased {
            self.lease = None;
        }
        if target.is_terminal() {
            self.finished_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Adds a standard duration to a timestamp, saturating at the maximum
/// representable instant.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Subtracts a standard duration from a timestamp, saturating at the minimum
/// representable instant.
pub(crate) fn sub_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}
