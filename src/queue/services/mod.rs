//! Application services for producers, workers and operators.

mod control;
mod error;
mod lease;
mod maintenance;
mod retry;
mod sweeper;

pub use control::{
    EnqueueReceipt, EnqueueRequest, QueueService, QueueStats, StatusUpdate, TaskStatusView,
    TaskSummary,
};
pub use error::{QueueError, QueueResult};
pub use lease::{HeartbeatStatus, LeaseManager, Outcome, ReclaimReport};
pub use maintenance::{MaintenanceReport, MaintenanceService};
pub use retry::{Finalization, RetryController};
pub use sweeper::{Sweeper, SweeperHandle};
