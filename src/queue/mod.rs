//! Durable task queue.
//!
//! Producers enqueue tasks, workers lease them one at a time under a
//! time-bounded lease, and every outcome flows back through a retry
//! controller that either schedules the next attempt or fails the task.
//! The module follows hexagonal architecture:
//!
//! - Domain types and the lifecycle state machine in [`domain`]
//! - Claim ordering in [`strategy`]
//! - Port contracts in [`ports`]
//! - In-memory and SQLite adapters in [`adapters`]
//! - Orchestration services in [`services`]
//! - Prometheus instrumentation in [`metrics`]

pub mod adapters;
pub mod domain;
pub mod metrics;
pub mod ports;
pub mod services;
pub mod strategy;

#[cfg(test)]
mod tests;
