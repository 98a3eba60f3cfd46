//! Shared fixtures and handlers for in-memory integration tests.

use crate::test_helpers::Services;
use async_trait::async_trait;
use leasehold::config::LeaseConfig;
use leasehold::queue::adapters::memory::InMemoryQueueRepository;
use leasehold::queue::domain::{Task, TaskId, TaskStatus};
use leasehold::queue::strategy::StrategyKind;
use leasehold::worker::{HandlerError, TaskHandler};
use rstest::fixture;
use std::sync::Mutex;
use std::time::Duration;

/// Services over the in-memory store.
pub type MemoryServices = Services<InMemoryQueueRepository>;

/// Provides fresh services with the priority strategy and default leases.
#[fixture]
pub fn services() -> MemoryServices {
    Services::new(
        InMemoryQueueRepository::new(),
        StrategyKind::Priority,
        LeaseConfig::default(),
    )
}

/// Handler that records every task it sees and reacts to the payload:
/// `fail` is a retryable error, `poison` a permanent one and `hang` never
/// returns.
#[derive(Debug, Default)]
pub struct ScriptedHandler {
    seen: Mutex<Vec<TaskId>>,
}

impl ScriptedHandler {
    /// Returns the ids handled so far, in order.
    pub fn seen(&self) -> Vec<TaskId> {
        self.seen.lock().expect("seen lock").clone()
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn handle(&self, task: &Task) -> Result<Option<Vec<u8>>, HandlerError> {
        self.seen.lock().expect("seen lock").push(task.id());
        match task.payload() {
            b"fail" => Err(HandlerError::retryable("temporary outage")),
            b"poison" => Err(HandlerError::permanent("cannot parse payload")),
            b"hang" => {
                std::future::pending::<()>().await;
                Ok(None)
            }
            other => Ok(Some(other.to_ascii_uppercase())),
        }
    }
}

/// Polls until no task is queued or leased, or the timeout passes.
pub async fn wait_until_drained(services: &MemoryServices, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let stats = services.queue.stats().await.expect("stats");
        let live = [TaskStatus::Queued, TaskStatus::Leased]
            .iter()
            .filter_map(|status| stats.by_status.get(status))
            .sum::<u64>();
        if live == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Polls until the task reaches `status`, or the timeout passes.
pub async fn wait_for_status(
    services: &MemoryServices,
    id: TaskId,
    status: TaskStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let view = services.queue.get_task_status(id).await.expect("status");
        if view.status == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
