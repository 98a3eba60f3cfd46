//! Port contracts for the queue.
//!
//! Ports define infrastructure-agnostic interfaces used by queue services.

pub mod repository;

#[cfg(test)]
pub use repository::MockQueueRepository;
pub use repository::{
    ClaimRequest, Enqueued, ExpiredLease, MutationEffect, MutationResult, PruneReport, QueueRepository,
    QueueRepositoryError, QueueRepositoryResult, StorageMaintenance, StoreStats, TaskMutation,
};
