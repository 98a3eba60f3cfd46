//! Error types for queue domain validation and lifecycle rules.

use super::{TaskId, TaskStatus, TaskType, WorkerId};
use thiserror::Error;

/// Errors returned while constructing or transitioning domain values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskDomainError {
    /// The task type is empty, too long, or contains whitespace.
    #[error("invalid task type '{0}'")]
    InvalidTaskType(String),

    /// The task type is well formed but not registered.
    #[error("unknown task type: {0}")]
    UnknownTaskType(TaskType),

    /// The priority falls outside the configured range.
    #[error("priority {priority} outside allowed range {min}..={max}")]
    PriorityOutOfRange {
        /// Requested priority.
        priority: i32,
        /// Lowest accepted value.
        min: i32,
        /// Highest accepted value.
        max: i32,
    },

    /// `max_attempts` is zero or larger than the stores can count.
    #[error("invalid max attempts {0}, expected 1..={limit}", limit = super::MAX_ATTEMPTS_LIMIT)]
    InvalidMaxAttempts(u32),

    /// The worker identifier is empty or too long.
    #[error("invalid worker identifier '{0}'")]
    InvalidWorkerId(String),

    /// A compatibility tag is not in `key=value` form.
    #[error("invalid tag '{0}', expected key=value")]
    InvalidTag(String),

    /// The idempotency key is empty after trimming.
    #[error("idempotency key must not be empty")]
    EmptyIdempotencyKey,

    /// The requested state transition is not permitted.
    #[error("task {task_id}: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Task being transitioned.
        task_id: TaskId,
        /// Current state.
        from: TaskStatus,
        /// Requested state.
        to: TaskStatus,
    },

    /// The task is queued but its `run_after` lies in the future.
    #[error("task {0} is not yet eligible to run")]
    NotYetEligible(TaskId),

    /// The caller does not hold the lease on the task.
    #[error("worker {worker_id} no longer holds the lease on task {task_id}")]
    LeaseLost {
        /// Task whose lease was lost.
        task_id: TaskId,
        /// Worker that attempted the operation.
        worker_id: WorkerId,
    },
}

/// Coarse classification of [`TaskDomainError`] used at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainErrorKind {
    /// Malformed input; nothing was created or changed.
    Validation,
    /// The request conflicts with the current task state.
    Conflict,
    /// The caller lost ownership of a leased task.
    LeaseLost,
}

impl TaskDomainError {
    /// Classifies the error for callers.
    #[must_use]
    pub const fn kind(&self) -> DomainErrorKind {
        match self {
            Self::InvalidTaskType(_)
            | Self::UnknownTaskType(_)
            | Self::PriorityOutOfRange { .. }
            | Self::InvalidMaxAttempts(_)
            | Self::InvalidWorkerId(_)
            | Self::InvalidTag(_)
            | Self::EmptyIdempotencyKey => DomainErrorKind::Validation,
            Self::InvalidStateTransition { .. } | Self::NotYetEligible(_) => {
                DomainErrorKind::Conflict
            }
            Self::LeaseLost { .. } => DomainErrorKind::LeaseLost,
        }
    }
}

/// Error returned while parsing task statuses from persistence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown task status: {0}")]
pub struct ParseTaskStatusError(pub String);

/// Error returned while parsing log levels from persistence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown log level: {0}")]
pub struct ParseLogLevelError(pub String);
