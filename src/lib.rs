//! Leasehold: a durable, single-host task queue on SQLite.
//!
//! Producers enqueue tasks with a type, payload, priority and compatibility
//! tags. Workers claim tasks under time-bounded leases, renew them with
//! heartbeats and report outcomes; failed attempts are retried with
//! exponential backoff until the attempt budget is spent. Leases abandoned
//! by crashed workers are reclaimed by a background sweeper.
//!
//! # Architecture
//!
//! Leasehold follows hexagonal architecture principles:
//!
//! - **Domain**: the task lifecycle state machine, free of storage concerns
//! - **Ports**: the repository contract every store implements
//! - **Adapters**: an in-memory store and a SQLite store in WAL mode
//! - **Services**: enqueue, claim, heartbeat, retry and maintenance
//!
//! # Modules
//!
//! - [`queue`]: domain, ports, adapters and services
//! - [`worker`]: the polling worker runtime
//! - [`config`]: YAML configuration with defaults
//! - [`telemetry`]: tracing subscriber setup

pub mod config;
pub mod queue;
pub mod telemetry;
pub mod worker;
