//! Checkpoints, backups and pruning against a real database.

use super::helpers::{SqliteStore, job, store};
use crate::test_helpers::ManualClock;
use chrono::TimeDelta;
use leasehold::config::{MaintenanceConfig, StorageConfig};
use leasehold::queue::adapters::sqlite::SqliteQueueRepository;
use leasehold::queue::ports::QueueRepository;
use leasehold::queue::services::MaintenanceService;
use rstest::rstest;
use std::sync::Arc;

fn maintenance(
    store: &SqliteStore,
    config: MaintenanceConfig,
) -> MaintenanceService<SqliteQueueRepository, ManualClock> {
    MaintenanceService::new(
        Arc::clone(&store.services.repository),
        Arc::clone(&store.services.clock),
        config,
    )
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_succeeds_under_wal(store: SqliteStore) {
    store.enqueue(job(b"x")).await;

    maintenance(&store, MaintenanceConfig::default())
        .checkpoint()
        .await
        .expect("checkpoint");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn backup_is_a_usable_database(store: SqliteStore) {
    let id = store.enqueue(job(b"precious")).await;
    let config = MaintenanceConfig {
        backup_dir: Some(store.dir.path().join("backups")),
        ..MaintenanceConfig::default()
    };

    let path = maintenance(&store, config)
        .backup()
        .await
        .expect("backup")
        .expect("backup directory configured");
    assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("db"));

    let restored = SqliteQueueRepository::open(&StorageConfig::at(&path)).expect("open backup");
    let task = restored
        .find_by_id(id)
        .await
        .expect("find")
        .expect("task in backup");
    assert_eq!(task.payload(), b"precious");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn backup_refuses_to_overwrite(store: SqliteStore) {
    let config = MaintenanceConfig {
        backup_dir: Some(store.dir.path().join("backups")),
        ..MaintenanceConfig::default()
    };
    let service = maintenance(&store, config);

    service.backup().await.expect("first backup");
    let second = service.backup().await;

    assert!(second.is_err());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn prune_removes_expired_history(store: SqliteStore) {
    let old = store.enqueue(job(b"")).await;
    let live = store.enqueue(job(b"")).await;
    store.services.queue.cancel_task(old).await.expect("cancel");
    store.services.clock.advance(TimeDelta::hours(200));

    let report = maintenance(&store, MaintenanceConfig::default())
        .prune()
        .await
        .expect("prune");

    assert_eq!(report.tasks_removed, 1);
    assert!(report.logs_removed >= 2);
    assert!(store.services.queue.get_task(old).await.is_err());
    assert!(store.services.queue.get_task(live).await.is_ok());
}
