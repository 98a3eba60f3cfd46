//! A set of runners sharing one shutdown signal.

use super::handler::TaskHandler;
use super::runner::{RunnerReport, WorkerRunner};
use crate::queue::ports::QueueRepository;
use crate::queue::services::QueueResult;
use mockable::Clock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Handle to spawned workers.
///
/// Dropping the group drops the shutdown sender, which also stops every
/// worker after its current task.
#[derive(Debug)]
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<QueueResult<RunnerReport>>>,
}

impl WorkerGroup {
    /// Spawns every runner on the current runtime.
    #[must_use]
    pub fn spawn<R, C, H>(runners: Vec<WorkerRunner<R, C, H>>) -> Self
    where
        R: QueueRepository + 'static,
        C: Clock + Send + Sync + 'static,
        H: TaskHandler + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = runners
            .into_iter()
            .map(|runner| {
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { runner.run(rx).await })
            })
            .collect();
        Self { shutdown_tx, joins }
    }

    /// Number of spawned workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.joins.len()
    }

    /// Returns whether the group has no workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Asks every worker to stop claiming. Running handlers finish first.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Requests shutdown and waits for every worker, returning their
    /// combined counts. Workers that failed to start are logged.
    pub async fn shutdown_and_join(self) -> RunnerReport {
        self.request_shutdown();
        let mut total = RunnerReport::default();
        for join in self.joins {
            match join.await {
                Ok(Ok(report)) => total = total.merge(report),
                Ok(Err(err)) => warn!(error = %err, "worker exited with error"),
                Err(err) => warn!(error = %err, "worker task ended abnormally"),
            }
        }
        total
    }
}
