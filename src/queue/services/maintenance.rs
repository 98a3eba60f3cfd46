//! Store housekeeping: pruning, WAL checkpoints and backups.

use super::error::{QueueError, QueueResult, now_millis};
use crate::config::MaintenanceConfig;
use crate::queue::domain::sub_duration;
use crate::queue::ports::{PruneReport, QueueRepository, QueueRepositoryError, StorageMaintenance};
use mockable::Clock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Summary of a full maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Rows removed by pruning.
    pub pruned: PruneReport,
    /// Backup written, if a backup directory is configured.
    pub backup: Option<PathBuf>,
}

/// Runs housekeeping against a store.
pub struct MaintenanceService<R, C>
where
    R: QueueRepository + StorageMaintenance,
    C: Clock + Send + Sync,
{
    repository: Arc<R>,
    clock: Arc<C>,
    config: MaintenanceConfig,
}

impl<R, C> MaintenanceService<R, C>
where
    R: QueueRepository + StorageMaintenance,
    C: Clock + Send + Sync,
{
    /// Creates a maintenance service.
    #[must_use]
    pub const fn new(repository: Arc<R>, clock: Arc<C>, config: MaintenanceConfig) -> Self {
        Self {
            repository,
            clock,
            config,
        }
    }

    /// Returns the maintenance settings.
    #[must_use]
    pub const fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Deletes terminal tasks and log rows older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn prune(&self) -> QueueResult<PruneReport> {
        let now = now_millis(&*self.clock);
        let before = sub_duration(now, self.config.retention());
        let report = self.repository.prune(before).await?;
        if report.tasks_removed > 0 || report.logs_removed > 0 {
            info!(
                tasks_removed = report.tasks_removed,
                logs_removed = report.logs_removed,
                %before,
                "pruned old tasks"
            );
        }
        Ok(report)
    }

    /// Flushes the write-ahead log into the database file.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn checkpoint(&self) -> QueueResult<()> {
        self.repository.checkpoint().await?;
        info!("checkpoint complete");
        Ok(())
    }

    /// Writes a timestamped snapshot into the backup directory. Returns
    /// `None` when no directory is configured.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Persistence`] when the directory cannot be
    /// created or the snapshot fails.
    pub async fn backup(&self) -> QueueResult<Option<PathBuf>> {
        let Some(dir) = self.config.backup_dir.as_ref() else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir)
            .map_err(|err| QueueError::Persistence(QueueRepositoryError::persistence(err)))?;
        let stamp = now_millis(&*self.clock).format("%Y%m%dT%H%M%S%.3fZ");
        let extension = self.repository.backup_extension();
        let path = dir.join(format!("leasehold-{stamp}.{extension}"));
        self.repository.backup_to(&path).await?;
        info!(path = %path.display(), "backup written");
        Ok(Some(path))
    }

    /// Runs prune, checkpoint and backup in that order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing step.
    pub async fn run_all(&self) -> QueueResult<MaintenanceReport> {
        let pruned = self.prune().await?;
        self.checkpoint().await?;
        let backup = self.backup().await?;
        Ok(MaintenanceReport { pruned, backup })
    }
}
