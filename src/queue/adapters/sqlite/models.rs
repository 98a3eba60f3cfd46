//! Diesel row models for queue persistence and their domain conversions.

use super::schema::{task_logs, task_queue, task_tags, workers};
use crate::queue::{
    domain::{
        IdempotencyKey, Lease, LogLevel, PersistedTaskData, Priority, TagSet, Task, TaskId,
        TaskLogEntry, TaskStatus, TaskType, Worker, WorkerId,
    },
    ports::{QueueRepositoryError, QueueRepositoryResult},
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable, Text};

/// Query result row for tasks.
#[derive(Debug, Clone, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = task_queue)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TaskRow {
    /// Task identifier.
    pub id: i64,
    /// Routing type.
    pub task_type: String,
    /// Priority.
    pub priority: i32,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// Compatibility tags as JSON.
    pub compatibility: String,
    /// Lifecycle status.
    pub status: String,
    /// Failed attempts.
    pub attempts: i32,
    /// Attempt budget.
    pub max_attempts: i32,
    /// Earliest eligible time.
    pub run_after_ms: i64,
    /// Lease expiry.
    pub lease_until_ms: Option<i64>,
    /// Lease holder.
    pub locked_by: Option<String>,
    /// Claim time.
    pub reserved_at_ms: Option<i64>,
    /// Deduplication key.
    pub idempotency_key: Option<String>,
    /// Terminal failure reason.
    pub error_message: Option<String>,
    /// Success result.
    pub task_result: Option<Vec<u8>>,
    /// Creation time.
    pub created_at_ms: i64,
    /// Latest lifecycle change.
    pub updated_at_ms: i64,
    /// Entry into a terminal state.
    pub finished_at_ms: Option<i64>,
}

/// Insert model for tasks; the identifier is assigned by SQLite.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = task_queue)]
pub struct NewTaskRow {
    /// Routing type.
    pub task_type: String,
    /// Priority.
    pub priority: i32,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// Compatibility tags as JSON.
    pub compatibility: String,
    /// Lifecycle status.
    pub status: String,
    /// Failed attempts.
    pub attempts: i32,
    /// Attempt budget.
    pub max_attempts: i32,
    /// Earliest eligible time.
    pub run_after_ms: i64,
    /// Deduplication key.
    pub idempotency_key: Option<String>,
    /// Creation time.
    pub created_at_ms: i64,
    /// Latest lifecycle change.
    pub updated_at_ms: i64,
}

/// Mutable task columns written after a transition.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = task_queue)]
#[diesel(treat_none_as_null = true)]
pub struct TaskChangeset {
    /// Lifecycle status.
    pub status: String,
    /// Failed attempts.
    pub attempts: i32,
    /// Earliest eligible time.
    pub run_after_ms: i64,
    /// Lease expiry.
    pub lease_until_ms: Option<i64>,
    /// Lease holder.
    pub locked_by: Option<String>,
    /// Claim time.
    pub reserved_at_ms: Option<i64>,
    /// Terminal failure reason.
    pub error_message: Option<String>,
    /// Success result.
    pub task_result: Option<Vec<u8>>,
    /// Latest lifecycle change.
    pub updated_at_ms: i64,
    /// Entry into a terminal state.
    pub finished_at_ms: Option<i64>,
}

/// Insert model for denormalised tags.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = task_tags)]
pub struct TaskTagRow {
    /// Owning task.
    pub task_id: i64,
    /// Tag in `key=value` form.
    pub tag: String,
}

/// Query result row for workers.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = workers)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WorkerRow {
    /// Worker identity.
    pub worker_id: String,
    /// Capabilities as JSON.
    pub capabilities: String,
    /// First registration time.
    pub registered_at_ms: i64,
    /// Latest heartbeat.
    pub last_heartbeat_ms: i64,
}

/// Query result row for task log entries.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = task_logs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TaskLogRow {
    /// Entry identifier.
    pub id: i64,
    /// Owning task.
    pub task_id: i64,
    /// Write time.
    pub timestamp_ms: i64,
    /// Severity.
    pub level: String,
    /// Message.
    pub message: String,
    /// Details as JSON.
    pub details: String,
}

/// Insert model for task log entries.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = task_logs)]
pub struct NewTaskLogRow {
    /// Owning task.
    pub task_id: i64,
    /// Write time.
    pub timestamp_ms: i64,
    /// Severity.
    pub level: String,
    /// Message.
    pub message: String,
    /// Details as JSON.
    pub details: String,
}

/// One `(type, status)` bucket of the stats query.
#[derive(Debug, Clone, QueryableByName)]
pub struct StatusCountRow {
    /// Routing type.
    #[diesel(sql_type = Text)]
    pub task_type: String,
    /// Lifecycle status.
    #[diesel(sql_type = Text)]
    pub status: String,
    /// Tasks in the bucket.
    #[diesel(sql_type = BigInt)]
    pub task_count: i64,
}

/// Oldest queued creation time.
#[derive(Debug, Clone, QueryableByName)]
pub struct OldestQueuedRow {
    /// Creation time of the oldest queued task, if any.
    #[diesel(sql_type = Nullable<BigInt>)]
    pub oldest_ms: Option<i64>,
}

/// A reclaimable lease.
#[derive(Debug, Clone, QueryableByName)]
pub struct ExpiredLeaseRow {
    /// Leased task.
    #[diesel(sql_type = BigInt)]
    pub task_id: i64,
    /// Recorded lease holder.
    #[diesel(sql_type = Text)]
    pub worker_id: String,
}

/// Converts a timestamp to stored milliseconds.
pub(super) fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Converts stored milliseconds back to a timestamp.
pub(super) fn from_ms(ms: i64) -> QueueRepositoryResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        QueueRepositoryError::persistence(std::io::Error::other(format!(
            "timestamp out of range: {ms}"
        )))
    })
}

fn from_ms_opt(ms: Option<i64>) -> QueueRepositoryResult<Option<DateTime<Utc>>> {
    ms.map(from_ms).transpose()
}

pub(super) fn tags_to_json(tags: &TagSet) -> QueueRepositoryResult<String> {
    serde_json::to_string(tags).map_err(QueueRepositoryError::persistence)
}

fn tags_from_json(raw: &str) -> QueueRepositoryResult<TagSet> {
    serde_json::from_str(raw).map_err(QueueRepositoryError::persistence)
}

pub(super) fn count_to_i32(value: u32) -> QueueRepositoryResult<i32> {
    i32::try_from(value).map_err(QueueRepositoryError::persistence)
}

fn count_from_i32(value: i32) -> QueueRepositoryResult<u32> {
    u32::try_from(value).map_err(QueueRepositoryError::persistence)
}

/// Builds the changeset persisting a task's mutable state.
pub(super) fn to_changeset(task: &Task) -> QueueRepositoryResult<TaskChangeset> {
    let lease = task.lease();
    Ok(TaskChangeset {
        status: task.status().as_str().to_owned(),
        attempts: count_to_i32(task.attempts())?,
        run_after_ms: to_ms(task.run_after()),
        lease_until_ms: lease.map(|held| to_ms(held.lease_until())),
        locked_by: lease.map(|held| held.worker_id().as_str().to_owned()),
        reserved_at_ms: lease.map(|held| to_ms(held.reserved_at())),
        error_message: task.error_message().map(str::to_owned),
        task_result: task.result().map(<[u8]>::to_vec),
        updated_at_ms: to_ms(task.updated_at()),
        finished_at_ms: task.finished_at().map(to_ms),
    })
}

/// Validates a stored row back into a task aggregate.
pub(super) fn row_to_task(row: TaskRow) -> QueueRepositoryResult<Task> {
    let TaskRow {
        id,
        task_type,
        priority,
        payload,
        compatibility,
        status,
        attempts,
        max_attempts,
        run_after_ms,
        lease_until_ms,
        locked_by,
        reserved_at_ms,
        idempotency_key,
        error_message,
        task_result,
        created_at_ms,
        updated_at_ms,
        finished_at_ms,
    } = row;

    let lease = match (locked_by, lease_until_ms, reserved_at_ms) {
        (Some(holder), Some(until_ms), Some(reserved_ms)) => Some(Lease::new(
            WorkerId::new(holder).map_err(QueueRepositoryError::persistence)?,
            from_ms(until_ms)?,
            from_ms(reserved_ms)?,
        )),
        _ => None,
    };

    let data = PersistedTaskData {
        id: TaskId::new(id),
        task_type: TaskType::new(task_type).map_err(QueueRepositoryError::persistence)?,
        priority: Priority::new(priority),
        payload,
        compatibility: tags_from_json(&compatibility)?,
        status: TaskStatus::try_from(status.as_str()).map_err(QueueRepositoryError::persistence)?,
        attempts: count_from_i32(attempts)?,
        max_attempts: count_from_i32(max_attempts)?,
        run_after: from_ms(run_after_ms)?,
        lease,
        idempotency_key: idempotency_key
            .map(IdempotencyKey::new)
            .transpose()
            .map_err(QueueRepositoryError::persistence)?,
        error_message,
        result: task_result,
        created_at: from_ms(created_at_ms)?,
        updated_at: from_ms(updated_at_ms)?,
        finished_at: from_ms_opt(finished_at_ms)?,
    };
    Ok(Task::from_persisted(data))
}

/// Validates a stored worker row.
pub(super) fn row_to_worker(row: WorkerRow) -> QueueRepositoryResult<Worker> {
    Ok(Worker::from_persisted(
        WorkerId::new(row.worker_id).map_err(QueueRepositoryError::persistence)?,
        tags_from_json(&row.capabilities)?,
        from_ms(row.registered_at_ms)?,
        from_ms(row.last_heartbeat_ms)?,
    ))
}

/// Validates a stored log row.
pub(super) fn row_to_log_entry(row: TaskLogRow) -> QueueRepositoryResult<TaskLogEntry> {
    Ok(TaskLogEntry {
        id: row.id,
        task_id: TaskId::new(row.task_id),
        timestamp: from_ms(row.timestamp_ms)?,
        level: LogLevel::try_from(row.level.as_str()).map_err(QueueRepositoryError::persistence)?,
        message: row.message,
        details: serde_json::from_str(&row.details).map_err(QueueRepositoryError::persistence)?,
    })
}
