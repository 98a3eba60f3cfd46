//! Temporary database fixtures for SQLite integration tests.

use crate::test_helpers::Services;
use leasehold::config::{LeaseConfig, StorageConfig};
use leasehold::queue::adapters::sqlite::SqliteQueueRepository;
use leasehold::queue::domain::TaskId;
use leasehold::queue::services::EnqueueRequest;
use leasehold::queue::strategy::StrategyKind;
use rstest::fixture;
use std::path::PathBuf;
use tempfile::TempDir;

/// Services over a database file that lives as long as the store.
pub struct SqliteStore {
    /// Directory holding the database; removed on drop.
    pub dir: TempDir,
    /// Services wired over the database.
    pub services: Services<SqliteQueueRepository>,
}

impl SqliteStore {
    /// Creates a fresh database using `strategy`.
    pub fn with_strategy(strategy: StrategyKind) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let repository =
            SqliteQueueRepository::open(&storage_at(&dir)).expect("open database");
        Self {
            services: Services::new(repository, strategy, LeaseConfig::default()),
            dir,
        }
    }

    /// Path of the database file.
    pub fn database_path(&self) -> PathBuf {
        self.dir.path().join("queue.db")
    }

    /// Enqueues `request` and returns the task id.
    pub async fn enqueue(&self, request: EnqueueRequest) -> TaskId {
        self.services
            .queue
            .enqueue(request)
            .await
            .expect("enqueue")
            .task_id
    }
}

/// Storage settings for a database inside `dir`.
pub fn storage_at(dir: &TempDir) -> StorageConfig {
    StorageConfig::at(dir.path().join("queue.db"))
}

/// Provides a fresh database with the priority strategy.
#[fixture]
pub fn store() -> SqliteStore {
    SqliteStore::with_strategy(StrategyKind::Priority)
}

/// A `job` request carrying `payload`.
pub fn job(payload: &[u8]) -> EnqueueRequest {
    EnqueueRequest::new("job", payload.to_vec())
}
