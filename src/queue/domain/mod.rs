//! Domain model for the durable task queue.
//!
//! Tasks, their lifecycle state machine, compatibility tags, workers and the
//! retry backoff function live here, free of any storage concern. Every
//! transition a store applies is one of the methods on [`Task`].

mod backoff;
mod error;
mod filter;
mod ids;
mod log;
mod registry;
mod status;
mod tags;
mod task;
mod worker;

pub use backoff::BackoffPolicy;
pub use error::{DomainErrorKind, ParseLogLevelError, ParseTaskStatusError, TaskDomainError};
pub use filter::{DEFAULT_LIST_LIMIT, TaskFilter};
pub use ids::{IdempotencyKey, Priority, TaskId, TaskType, WorkerId};
pub use log::{LogLevel, LogRecord, TaskLogEntry};
pub use registry::TaskTypeRegistry;
pub use status::TaskStatus;
pub use tags::{Tag, TagSet};
pub use task::{
    FailureDisposition, FailureOutcome, Lease, MAX_ATTEMPTS_LIMIT, NewTask, PersistedTaskData,
    Task,
};
pub(crate) use task::{add_duration, sub_duration};
pub use worker::Worker;
