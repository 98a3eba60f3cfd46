//! Service-level error classification.

use crate::queue::domain::{DomainErrorKind, TaskDomainError, TaskId, WorkerId};
use crate::queue::ports::QueueRepositoryError;
use chrono::{DateTime, SubsecRound, Utc};
use mockable::Clock;
use thiserror::Error;

/// Errors returned by queue services.
///
/// Callers branch on the variant: validation and conflict errors are the
/// caller's fault and never succeed on retry, `TransientStore` may succeed
/// on retry, and `LeaseLost` tells a worker to abandon its task.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The request was malformed or broke a registry rule.
    #[error("invalid request: {0}")]
    Validation(TaskDomainError),

    /// The request conflicts with the task's current state.
    #[error("conflict: {0}")]
    Conflict(TaskDomainError),

    /// No task has this identifier.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The store stayed locked through every retry.
    #[error("store busy after {attempts} attempts")]
    TransientStore {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The worker no longer holds the task's lease.
    #[error("worker {worker_id} no longer holds the lease on task {task_id}")]
    LeaseLost {
        /// Task whose lease was lost.
        task_id: TaskId,
        /// Worker that asked.
        worker_id: WorkerId,
    },

    /// Any other storage failure.
    #[error(transparent)]
    Persistence(QueueRepositoryError),
}

impl QueueError {
    /// Returns whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore { .. })
    }
}

impl From<TaskDomainError> for QueueError {
    fn from(err: TaskDomainError) -> Self {
        match err.kind() {
            DomainErrorKind::Validation => Self::Validation(err),
            DomainErrorKind::Conflict => Self::Conflict(err),
            DomainErrorKind::LeaseLost => match err {
                TaskDomainError::LeaseLost { task_id, worker_id } => {
                    Self::LeaseLost { task_id, worker_id }
                }
                other => Self::Conflict(other),
            },
        }
    }
}

impl From<QueueRepositoryError> for QueueError {
    fn from(err: QueueRepositoryError) -> Self {
        match err {
            QueueRepositoryError::NotFound(id) => Self::NotFound(id),
            QueueRepositoryError::Domain(domain) => domain.into(),
            QueueRepositoryError::Busy { attempts } => Self::TransientStore { attempts },
            other @ QueueRepositoryError::Persistence(_) => Self::Persistence(other),
        }
    }
}

/// Result type for queue service operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Reads the clock at the millisecond precision the store keeps.
pub(crate) fn now_millis<C: Clock + ?Sized>(clock: &C) -> DateTime<Utc> {
    clock.utc().trunc_subsecs(3)
}
