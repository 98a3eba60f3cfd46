//! The contract between the worker runtime and application code.

use crate::queue::domain::{FailureDisposition, Task};
use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by a [`TaskHandler`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    disposition: FailureDisposition,
}

impl HandlerError {
    /// A failure that another attempt may fix.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            disposition: FailureDisposition::Retryable,
        }
    }

    /// A failure no retry can fix; the task fails immediately.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            disposition: FailureDisposition::Permanent,
        }
    }

    /// Returns the error text.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns whether the failure may be retried.
    #[must_use]
    pub const fn disposition(&self) -> FailureDisposition {
        self.disposition
    }
}

/// Application code run for each claimed task.
///
/// The future is dropped if the lease is lost or the task is cancelled
/// while it runs, so handlers should be safe to stop at any await point.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Processes `task`, returning an optional result payload.
    async fn handle(&self, task: &Task) -> Result<Option<Vec<u8>>, HandlerError>;
}
