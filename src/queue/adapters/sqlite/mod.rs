//! SQLite adapters for durable queue storage.

mod engine;
mod models;
mod repository;
mod schema;

pub use engine::{SCHEMA_VERSION, SqlitePool, StorageEngine};
pub use repository::SqliteQueueRepository;
