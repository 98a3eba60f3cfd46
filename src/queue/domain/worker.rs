//! Registered worker records.

use super::{TagSet, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A worker known to the queue, with its declared capabilities and liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    worker_id: WorkerId,
    capabilities: TagSet,
    registered_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

impl Worker {
    /// Creates a worker record first seen at `now`.
    #[must_use]
    pub const fn new(worker_id: WorkerId, capabilities: TagSet, now: DateTime<Utc>) -> Self {
        Self {
            worker_id,
            capabilities,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// Reconstructs a worker from storage.
    #[must_use]
    pub const fn from_persisted(
        worker_id: WorkerId,
        capabilities: TagSet,
        registered_at: DateTime<Utc>,
        last_heartbeat: DateTime<Utc>,
    ) -> Self {
        Self {
            worker_id,
            capabilities,
            registered_at,
            last_heartbeat,
        }
    }

    /// Returns the worker identifier.
    #[must_use]
    pub const fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Returns the declared capabilities.
    #[must_use]
    pub const fn capabilities(&self) -> &TagSet {
        &self.capabilities
    }

    /// Returns when the worker first registered.
    #[must_use]
    pub const fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Returns the last time the worker was heard from.
    #[must_use]
    pub const fn last_heartbeat(&self) -> DateTime<Utc> {
        self.last_heartbeat
    }

    /// Records that the worker was heard from at `now`.
    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = self.last_heartbeat.max(now);
    }

    /// Replaces the declared capabilities.
    pub fn set_capabilities(&mut self, capabilities: TagSet) {
        self.capabilities = capabilities;
    }

    /// Returns whether the last heartbeat is older than `stale_before`.
    #[must_use]
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.last_heartbeat < stale_before
    }
}
