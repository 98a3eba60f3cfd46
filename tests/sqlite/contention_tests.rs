//! Busy handling when another connection holds the write lock.

use super::helpers::{job, storage_at};
use crate::test_helpers::Services;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use leasehold::config::{LeaseConfig, StorageConfig};
use leasehold::queue::adapters::sqlite::SqliteQueueRepository;
use leasehold::queue::services::QueueError;
use leasehold::queue::strategy::StrategyKind;
use rstest::rstest;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::TempDir;

fn open_with(
    dir: &TempDir,
    busy_timeout_ms: u64,
    busy_retries: u32,
    busy_retry_base_ms: u64,
) -> (Services<SqliteQueueRepository>, PathBuf) {
    let config = StorageConfig {
        busy_timeout_ms,
        busy_retries,
        busy_retry_base_ms,
        ..storage_at(dir)
    };
    let repository = SqliteQueueRepository::open(&config).expect("open database");
    let services = Services::new(repository, StrategyKind::Fifo, LeaseConfig::default());
    (services, config.path)
}

/// Takes the write lock on `path` from a separate connection and keeps it
/// for `hold`. Returns once the lock is held.
fn hold_write_lock(path: &Path, hold: Duration) -> JoinHandle<()> {
    let url = path.to_string_lossy().into_owned();
    let (locked_tx, locked_rx) = mpsc::channel();
    let holder = std::thread::spawn(move || {
        let mut connection = SqliteConnection::establish(&url).expect("second connection");
        connection
            .batch_execute("BEGIN IMMEDIATE;")
            .expect("take write lock");
        locked_tx.send(()).expect("signal lock");
        std::thread::sleep(hold);
        connection.batch_execute("COMMIT;").expect("release write lock");
    });
    locked_rx.recv().expect("lock acquired");
    holder
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn short_lock_is_waited_out() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (services, path) = open_with(&dir, 5, 12, 20);

    let holder = hold_write_lock(&path, Duration::from_millis(40));
    let receipt = services
        .queue
        .enqueue(job(b"patient"))
        .await
        .expect("enqueue succeeds once the lock is released");
    holder.join().expect("lock holder");

    assert!(receipt.created);
    let stats = services.queue.stats().await.expect("stats");
    assert_eq!(stats.total, 1);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn long_lock_surfaces_transient_store() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (services, path) = open_with(&dir, 5, 3, 5);

    let holder = hold_write_lock(&path, Duration::from_millis(1_500));
    let result = services.queue.enqueue(job(b"impatient")).await;

    assert!(
        matches!(result, Err(QueueError::TransientStore { attempts: 3 })),
        "{result:?}"
    );
    assert!(result.is_err_and(|err| err.is_transient()));

    holder.join().expect("lock holder");
    services
        .queue
        .enqueue(job(b"after release"))
        .await
        .expect("store usable once the lock is released");
}
