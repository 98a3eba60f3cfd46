//! Unit tests for the queue module.
//!
//! Tests are organised by concern: the domain model and its state machine,
//! the backoff function, claim strategies, and the services over both a real
//! in-memory store and a mocked repository.

mod strategy_tests;
mod support;
