//! Background sweeper tests.

use super::helpers::{MemoryServices, services, wait_for_status};
use crate::test_helpers::worker;
use chrono::TimeDelta;
use leasehold::config::MaintenanceConfig;
use leasehold::queue::domain::TaskStatus;
use leasehold::queue::services::{EnqueueRequest, MaintenanceService, Sweeper};
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;

fn busy_schedule() -> MaintenanceConfig {
    MaintenanceConfig {
        reclaim_interval_secs: 0,
        prune_interval_secs: 0,
        checkpoint_interval_secs: 0,
        ..MaintenanceConfig::default()
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn sweeper_requeues_abandoned_tasks(services: MemoryServices) {
    let id = services
        .queue
        .enqueue(EnqueueRequest::new("job", b"work".to_vec()))
        .await
        .expect("enqueue")
        .task_id;
    services
        .leases
        .claim_next(&worker("crashed"), None, None)
        .await
        .expect("claim")
        .expect("task available");
    services.clock.advance(TimeDelta::seconds(301));
    let maintenance = Arc::new(MaintenanceService::new(
        Arc::clone(&services.repository),
        Arc::clone(&services.clock),
        busy_schedule(),
    ));

    let handle = Sweeper::new(Arc::clone(&services.leases), maintenance).spawn();
    let requeued = wait_for_status(&services, id, TaskStatus::Queued, Duration::from_secs(5)).await;
    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("sweeper stops promptly");

    assert!(requeued);
    let view = services.queue.get_task_status(id).await.expect("status");
    assert_eq!(view.attempts, 1);
    assert!(view.locked_by.is_none());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn sweeper_leaves_live_leases_alone(services: MemoryServices) {
    let id = services
        .queue
        .enqueue(EnqueueRequest::new("job", b"work".to_vec()))
        .await
        .expect("enqueue")
        .task_id;
    services
        .leases
        .claim_next(&worker("busy"), None, None)
        .await
        .expect("claim")
        .expect("task available");
    let maintenance = Arc::new(MaintenanceService::new(
        Arc::clone(&services.repository),
        Arc::clone(&services.clock),
        busy_schedule(),
    ));

    let handle = Sweeper::new(Arc::clone(&services.leases), maintenance).spawn();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;

    let view = services.queue.get_task_status(id).await.expect("status");
    assert_eq!(view.status, TaskStatus::Leased);
    assert_eq!(view.locked_by, Some(worker("busy")));
}
