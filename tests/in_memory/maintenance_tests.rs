//! Pruning and snapshot tests against the in-memory store.

use super::helpers::{MemoryServices, services};
use crate::test_helpers::ManualClock;
use chrono::TimeDelta;
use leasehold::config::MaintenanceConfig;
use leasehold::queue::adapters::memory::InMemoryQueueRepository;
use leasehold::queue::services::{EnqueueRequest, MaintenanceService};
use rstest::rstest;
use std::sync::Arc;

fn maintenance(
    services: &MemoryServices,
    config: MaintenanceConfig,
) -> MaintenanceService<InMemoryQueueRepository, ManualClock> {
    MaintenanceService::new(
        Arc::clone(&services.repository),
        Arc::clone(&services.clock),
        config,
    )
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn prune_drops_old_terminal_tasks_and_frees_their_keys(services: MemoryServices) {
    let done = services
        .queue
        .enqueue(EnqueueRequest::new("job", Vec::new()).with_idempotency_key("nightly"))
        .await
        .expect("enqueue");
    let pending = services
        .queue
        .enqueue(EnqueueRequest::new("job", Vec::new()))
        .await
        .expect("enqueue");
    services.queue.cancel_task(done.task_id).await.expect("cancel");
    services.clock.advance(TimeDelta::hours(169));

    let report = maintenance(&services, MaintenanceConfig::default())
        .prune()
        .await
        .expect("prune");

    assert_eq!(report.tasks_removed, 1);
    assert_eq!(report.logs_removed, 3);
    assert!(services.queue.get_task(done.task_id).await.is_err());
    assert!(services.queue.get_task(pending.task_id).await.is_ok());
    let again = services
        .queue
        .enqueue(EnqueueRequest::new("job", Vec::new()).with_idempotency_key("nightly"))
        .await
        .expect("enqueue");
    assert!(again.created);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn recent_terminal_tasks_survive_prune(services: MemoryServices) {
    let done = services
        .queue
        .enqueue(EnqueueRequest::new("job", Vec::new()))
        .await
        .expect("enqueue");
    services.queue.cancel_task(done.task_id).await.expect("cancel");
    services.clock.advance(TimeDelta::hours(1));

    let report = maintenance(&services, MaintenanceConfig::default())
        .prune()
        .await
        .expect("prune");

    assert_eq!(report.tasks_removed, 0);
    assert_eq!(report.logs_removed, 0);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn backup_writes_a_timestamped_snapshot(services: MemoryServices) {
    services
        .queue
        .enqueue(EnqueueRequest::new("job", b"keep me".to_vec()))
        .await
        .expect("enqueue");
    let dir = tempfile::tempdir().expect("temp dir");
    let config = MaintenanceConfig {
        backup_dir: Some(dir.path().join("backups")),
        ..MaintenanceConfig::default()
    };

    let report = maintenance(&services, config)
        .run_all()
        .await
        .expect("maintenance");

    let path = report.backup.expect("backup written");
    assert_eq!(
        path.file_name().and_then(|name| name.to_str()),
        Some("leasehold-20260301T090000.000Z.json")
    );
    let snapshot: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).expect("read backup")).expect("json");
    assert_eq!(
        snapshot.get("tasks").and_then(serde_json::Value::as_array).map(Vec::len),
        Some(1)
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn backup_without_directory_is_skipped(services: MemoryServices) {
    let written = maintenance(&services, MaintenanceConfig::default())
        .backup()
        .await
        .expect("backup");

    assert!(written.is_none());
}
