//! Append-only task log entries.

use super::{ParseLogLevelError, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal lifecycle event.
    Info,
    /// Recoverable problem such as a scheduled retry.
    Warn,
    /// Terminal failure.
    Error,
}

impl LogLevel {
    /// Returns the canonical storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for LogLevel {
    type Error = ParseLogLevelError;

    fn try_from(value: &str) -> Result<Self, ParseLogLevelError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(ParseLogLevelError(value.to_owned())),
        }
    }
}

/// Log line produced by a mutation, not yet attached to a task or time.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    level: LogLevel,
    message: String,
    details: serde_json::Value,
}

impl LogRecord {
    /// Creates a record with empty details.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Shorthand for an `info` record.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Returns the level.
    #[must_use]
    pub const fn level(&self) -> LogLevel {
        self.level
    }

    /// Returns the message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the structured details.
    #[must_use]
    pub const fn details(&self) -> &serde_json::Value {
        &self.details
    }

    /// Binds the record to a task and timestamp.
    #[must_use]
    pub fn into_entry(self, id: i64, task_id: TaskId, timestamp: DateTime<Utc>) -> TaskLogEntry {
        TaskLogEntry {
            id,
            task_id,
            timestamp,
            level: self.level,
            message: self.message,
            details: self.details,
        }
    }
}

/// Persisted task log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    /// Store-assigned, increasing entry identifier.
    pub id: i64,
    /// Task the entry belongs to.
    pub task_id: TaskId,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Structured details, `null` when absent.
    pub details: serde_json::Value,
}
