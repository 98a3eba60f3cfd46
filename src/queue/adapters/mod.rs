//! Adapter implementations of the queue ports.

pub mod memory;
pub mod sqlite;

use crate::queue::domain::{LogRecord, Task};
use serde_json::json;

/// Log entry appended when a task is first stored.
pub(crate) fn enqueued_record(task: &Task) -> LogRecord {
    LogRecord::info("enqueued").with_details(json!({
        "task_type": task.task_type().as_str(),
        "priority": task.priority().value(),
        "max_attempts": task.max_attempts(),
        "run_after": task.run_after().to_rfc3339(),
    }))
}

/// Log entry appended when a task is leased by a claim.
pub(crate) fn claimed_record(task: &Task) -> LogRecord {
    let (worker_id, lease_until) = task.lease().map_or((None, None), |lease| {
        (
            Some(lease.worker_id().to_string()),
            Some(lease.lease_until().to_rfc3339()),
        )
    });
    LogRecord::info("claimed").with_details(json!({
        "worker_id": worker_id,
        "lease_until": lease_until,
        "attempts": task.attempts(),
    }))
}
