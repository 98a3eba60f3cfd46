//! Background loop that reclaims expired leases and runs housekeeping on
//! fixed intervals.

use super::lease::LeaseManager;
use super::maintenance::MaintenanceService;
use crate::queue::ports::{QueueRepository, StorageMaintenance};
use mockable::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Periodic reclamation and maintenance driver.
pub struct Sweeper<R, C>
where
    R: QueueRepository + StorageMaintenance,
    C: Clock + Send + Sync,
{
    leases: Arc<LeaseManager<R, C>>,
    maintenance: Arc<MaintenanceService<R, C>>,
}

impl<R, C> Sweeper<R, C>
where
    R: QueueRepository + StorageMaintenance + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Creates a sweeper over the given services.
    #[must_use]
    pub const fn new(
        leases: Arc<LeaseManager<R, C>>,
        maintenance: Arc<MaintenanceService<R, C>>,
    ) -> Self {
        Self {
            leases,
            maintenance,
        }
    }

    /// Runs until `shutdown` turns `true` or its sender is dropped.
    ///
    /// Reclamation runs immediately and then every reclaim interval; the
    /// other jobs first run one interval after start. A failing job is
    /// logged and retried on its next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let config = self.maintenance.config();
        let mut reclaim = ticker(config.reclaim_interval(), true);
        let mut prune = ticker(config.prune_interval(), false);
        let mut checkpoint = ticker(config.checkpoint_interval(), false);
        let mut backup = ticker(config.backup_interval(), false);
        let backups_enabled = config.backup_dir.is_some();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = reclaim.tick() => {
                    if let Err(err) = self.leases.reclaim_expired_leases().await {
                        warn!(error = %err, "lease reclamation failed");
                    }
                }
                _ = prune.tick() => {
                    if let Err(err) = self.maintenance.prune().await {
                        warn!(error = %err, "prune failed");
                    }
                }
                _ = checkpoint.tick() => {
                    if let Err(err) = self.maintenance.checkpoint().await {
                        warn!(error = %err, "checkpoint failed");
                    }
                }
                _ = backup.tick(), if backups_enabled => {
                    if let Err(err) = self.maintenance.backup().await {
                        warn!(error = %err, "backup failed");
                    }
                }
            }
        }
        debug!("sweeper stopped");
    }

    /// Spawns the loop on the current runtime.
    #[must_use]
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });
        SweeperHandle { shutdown_tx, join }
    }
}

/// Handle to a spawned [`Sweeper`].
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the loop after its current job and waits for it.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "sweeper task ended abnormally");
        }
    }
}

fn ticker(period: Duration, immediate: bool) -> Interval {
    let every = period.max(Duration::from_millis(1));
    let start = if immediate {
        Instant::now()
    } else {
        Instant::now() + every
    };
    let mut interval = tokio::time::interval_at(start, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
