//! Worker runtime.
//!
//! A [`WorkerRunner`] claims tasks for one worker identity, renews the lease
//! while its [`TaskHandler`] runs, and reports the outcome. A
//! [`WorkerGroup`] runs several runners under one shutdown signal.

mod group;
mod handler;
mod runner;

pub use group::WorkerGroup;
pub use handler::{HandlerError, TaskHandler};
pub use runner::{RunOutcome, RunnerReport, WorkerRunner};
