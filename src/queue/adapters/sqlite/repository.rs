//! SQLite repository implementation for queue storage.

use super::{
    engine::StorageEngine,
    models::{
        ExpiredLeaseRow, NewTaskLogRow, NewTaskRow, OldestQueuedRow, StatusCountRow,
        TaskLogRow, TaskRow, TaskTagRow, WorkerRow, count_to_i32, from_ms, row_to_log_entry,
        row_to_task, row_to_worker, tags_to_json, to_changeset, to_ms,
    },
    schema::{task_logs, task_queue, task_tags, workers},
};
use crate::config::StorageConfig;
use crate::queue::{
    adapters::{claimed_record, enqueued_record},
    domain::{
        LogRecord, NewTask, Task, TaskFilter, TaskId, TaskLogEntry, TaskStatus, TaskType, Worker,
        WorkerId,
    },
    ports::{
        ClaimRequest, Enqueued, ExpiredLease, MutationEffect, MutationResult, PruneReport, QueueRepository,
        QueueRepositoryError, QueueRepositoryResult, StorageMaintenance, StoreStats, TaskMutation,
    },
    strategy::{CandidateOrder, ClaimStrategy},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable, Text};
use diesel::sqlite::SqliteConnection;
use std::path::Path;
use std::sync::Arc;

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

/// SQLite-backed queue repository.
#[derive(Debug, Clone)]
pub struct SqliteQueueRepository {
    engine: StorageEngine,
}

impl SqliteQueueRepository {
    /// Creates a repository over an opened storage engine.
    #[must_use]
    pub const fn new(engine: StorageEngine) -> Self {
        Self { engine }
    }

    /// Opens the database described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueRepositoryError::Persistence`] when the store cannot
    /// be opened or initialised.
    pub fn open(config: &StorageConfig) -> QueueRepositoryResult<Self> {
        StorageEngine::open(config).map(Self::new)
    }

    /// Returns the underlying storage engine.
    #[must_use]
    pub const fn engine(&self) -> &StorageEngine {
        &self.engine
    }
}

#[async_trait]
impl QueueRepository for SqliteQueueRepository {
    async fn enqueue(&self, task: NewTask) -> QueueRepositoryResult<Enqueued> {
        let new_row = to_new_row(&task)?;
        let tags = task.compatibility().to_strings();
        self.engine
            .with_transaction(move |connection| {
                if let Some(key) = &new_row.idempotency_key {
                    let existing = task_queue::table
                        .filter(task_queue::idempotency_key.eq(key))
                        .select(TaskRow::as_select())
                        .first::<TaskRow>(connection)
                        .optional()?;
                    if let Some(row) = existing {
                        return Ok(Enqueued {
                            task: row_to_task(row)?,
                            created: false,
                        });
                    }
                }

                let id = diesel::insert_into(task_queue::table)
                    .values(&new_row)
                    .returning(task_queue::id)
                    .get_result::<i64>(connection)?;
                let tag_rows: Vec<TaskTagRow> = tags
                    .iter()
                    .map(|tag| TaskTagRow {
                        task_id: id,
                        tag: tag.clone(),
                    })
                    .collect();
                if !tag_rows.is_empty() {
                    diesel::insert_into(task_tags::table)
                        .values(&tag_rows)
                        .execute(connection)?;
                }

                let stored = task.clone().into_task(TaskId::new(id));
                append_log(connection, stored.id(), stored.created_at(), enqueued_record(&stored))?;
                Ok(Enqueued {
                    task: stored,
                    created: true,
                })
            })
            .await
    }

    async fn find_by_id(&self, id: TaskId) -> QueueRepositoryResult<Option<Task>> {
        self.engine
            .with_read_only(move |connection| load_task(connection, id))
            .await
    }

    async fn list(&self, filter: &TaskFilter) -> QueueRepositoryResult<Vec<Task>> {
        let status = filter.status().map(|value| value.as_str().to_owned());
        let task_type = filter.task_type().map(|value| value.as_str().to_owned());
        let tags = if filter.tags().is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&filter.tags().to_strings())
                    .map_err(QueueRepositoryError::persistence)?,
            )
        };
        let limit = i64::from(filter.limit());
        let offset = i64::from(filter.offset());
        self.engine
            .with_read_only(move |connection| {
                diesel::sql_query(concat!(
                    "SELECT q.* FROM task_queue q ",
                    "WHERE (?1 IS NULL OR q.status = ?1) ",
                    "AND (?2 IS NULL OR q.task_type = ?2) ",
                    "AND (?3 IS NULL OR (SELECT COUNT(*) FROM task_tags t ",
                    "WHERE t.task_id = q.id AND t.tag IN (SELECT value FROM json_each(?3))) ",
                    "= json_array_length(?3)) ",
                    "ORDER BY q.id LIMIT ?4 OFFSET ?5",
                ))
                .bind::<Nullable<Text>, _>(status.clone())
                .bind::<Nullable<Text>, _>(task_type.clone())
                .bind::<Nullable<Text>, _>(tags.clone())
                .bind::<BigInt, _>(limit)
                .bind::<BigInt, _>(offset)
                .load::<TaskRow>(connection)?
                .into_iter()
                .map(row_to_task)
                .collect()
            })
            .await
    }

    async fn mutate(
        &self,
        id: TaskId,
        mutation: TaskMutation,
    ) -> QueueRepositoryResult<MutationResult> {
        self.engine
            .with_transaction(move |connection| {
                let mut task =
                    load_task(connection, id)?.ok_or(QueueRepositoryError::NotFound(id))?;
                let effect = mutation(&mut task)?;
                if effect == MutationEffect::Unchanged {
                    return Ok(MutationResult {
                        task,
                        changed: false,
                    });
                }
                persist_task(connection, &task)?;
                if let MutationEffect::Logged(record) = effect {
                    append_log(connection, id, task.updated_at(), record)?;
                }
                Ok(MutationResult {
                    task,
                    changed: true,
                })
            })
            .await
    }

    async fn claim_next(
        &self,
        request: ClaimRequest,
        strategy: Arc<dyn ClaimStrategy>,
    ) -> QueueRepositoryResult<Option<Task>> {
        let capabilities = request
            .capabilities
            .as_ref()
            .map(|tags| serde_json::to_string(&tags.to_strings()))
            .transpose()
            .map_err(QueueRepositoryError::persistence)?;
        let window = i64::try_from(strategy.window()).map_err(QueueRepositoryError::persistence)?;
        let sql = format!(
            concat!(
                "SELECT q.* FROM task_queue q ",
                "WHERE q.status = 'queued' AND q.run_after_ms <= ?1 ",
                "AND (?2 IS NULL OR q.task_type = ?2) ",
                "AND (?3 IS NULL OR NOT EXISTS (SELECT 1 FROM task_tags t ",
                "WHERE t.task_id = q.id AND t.tag NOT IN (SELECT value FROM json_each(?3)))) ",
                "ORDER BY {} LIMIT ?4",
            ),
            order_by(strategy.ordering())
        );
        let task_type = request.task_type.as_ref().map(|value| value.as_str().to_owned());

        self.engine
            .with_transaction(move |connection| {
                let candidates = diesel::sql_query(sql.as_str())
                    .bind::<BigInt, _>(to_ms(request.now))
                    .bind::<Nullable<Text>, _>(task_type.clone())
                    .bind::<Nullable<Text>, _>(capabilities.clone())
                    .bind::<BigInt, _>(window)
                    .load::<TaskRow>(connection)?
                    .into_iter()
                    .map(row_to_task)
                    .collect::<QueueRepositoryResult<Vec<Task>>>()?;

                let claimed = match strategy.select_candidate(&candidates) {
                    Some(chosen) => {
                        let mut task = chosen.clone();
                        task.lease_to(request.worker_id.clone(), request.lease_until, request.now)?;
                        persist_task(connection, &task)?;
                        append_log(connection, task.id(), request.now, claimed_record(&task))?;
                        Some(task)
                    }
                    None => None,
                };
                touch_or_register(connection, &request, capabilities.as_deref())?;
                Ok(claimed)
            })
            .await
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        orphan_before: DateTime<Utc>,
    ) -> QueueRepositoryResult<Vec<ExpiredLease>> {
        self.engine
            .with_read_only(move |connection| {
                diesel::sql_query(concat!(
                    "SELECT q.id AS task_id, q.locked_by AS worker_id FROM task_queue q ",
                    "LEFT JOIN workers w ON w.worker_id = q.locked_by ",
                    "WHERE q.status = 'leased' AND q.lease_until_ms < ?1 ",
                    "AND (w.worker_id IS NULL OR w.last_heartbeat_ms < ?2 ",
                    "OR q.lease_until_ms < ?3) ",
                    "ORDER BY q.id",
                ))
                .bind::<BigInt, _>(to_ms(now))
                .bind::<BigInt, _>(to_ms(stale_before))
                .bind::<BigInt, _>(to_ms(orphan_before))
                .load::<ExpiredLeaseRow>(connection)?
                .into_iter()
                .map(|row| -> QueueRepositoryResult<ExpiredLease> {
                    Ok(ExpiredLease {
                        task_id: TaskId::new(row.task_id),
                        worker_id: WorkerId::new(row.worker_id)
                            .map_err(QueueRepositoryError::persistence)?,
                    })
                })
                .collect()
            })
            .await
    }

    async fn upsert_worker(&self, worker: Worker) -> QueueRepositoryResult<Worker> {
        let capabilities = tags_to_json(worker.capabilities())?;
        self.engine
            .with_transaction(move |connection| {
                diesel::sql_query(concat!(
                    "INSERT INTO workers (worker_id, capabilities, registered_at_ms, last_heartbeat_ms) ",
                    "VALUES (?1, ?2, ?3, ?4) ",
                    "ON CONFLICT (worker_id) DO UPDATE SET ",
                    "capabilities = excluded.capabilities, ",
                    "last_heartbeat_ms = MAX(workers.last_heartbeat_ms, excluded.last_heartbeat_ms)",
                ))
                .bind::<Text, _>(worker.worker_id().as_str())
                .bind::<Text, _>(capabilities.as_str())
                .bind::<BigInt, _>(to_ms(worker.registered_at()))
                .bind::<BigInt, _>(to_ms(worker.last_heartbeat()))
                .execute(connection)?;
                load_worker(connection, worker.worker_id())?.ok_or_else(|| {
                    QueueRepositoryError::persistence(std::io::Error::other(
                        "worker row missing after upsert",
                    ))
                })
            })
            .await
    }

    async fn touch_worker(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> QueueRepositoryResult<bool> {
        let id = worker_id.as_str().to_owned();
        self.engine
            .with_transaction(move |connection| {
                let updated = diesel::sql_query(
                    "UPDATE workers SET last_heartbeat_ms = MAX(last_heartbeat_ms, ?1) WHERE worker_id = ?2",
                )
                .bind::<BigInt, _>(to_ms(now))
                .bind::<Text, _>(id.as_str())
                .execute(connection)?;
                Ok(updated > 0)
            })
            .await
    }

    async fn find_worker(&self, worker_id: &WorkerId) -> QueueRepositoryResult<Option<Worker>> {
        let id = worker_id.clone();
        self.engine
            .with_read_only(move |connection| load_worker(connection, &id))
            .await
    }

    async fn task_logs(&self, id: TaskId) -> QueueRepositoryResult<Vec<TaskLogEntry>> {
        self.engine
            .with_read_only(move |connection| {
                task_logs::table
                    .filter(task_logs::task_id.eq(id.value()))
                    .order(task_logs::id.asc())
                    .select(TaskLogRow::as_select())
                    .load::<TaskLogRow>(connection)?
                    .into_iter()
                    .map(row_to_log_entry)
                    .collect()
            })
            .await
    }

    async fn stats(&self) -> QueueRepositoryResult<StoreStats> {
        self.engine
            .with_read_only(|connection| {
                let counts = diesel::sql_query(concat!(
                    "SELECT task_type, status, COUNT(*) AS task_count FROM task_queue ",
                    "GROUP BY task_type, status ORDER BY task_type, status",
                ))
                .load::<StatusCountRow>(connection)?
                .into_iter()
                .map(|row| -> QueueRepositoryResult<(TaskType, TaskStatus, u64)> {
                    Ok((
                        TaskType::new(row.task_type).map_err(QueueRepositoryError::persistence)?,
                        TaskStatus::try_from(row.status.as_str())
                            .map_err(QueueRepositoryError::persistence)?,
                        u64::try_from(row.task_count).map_err(QueueRepositoryError::persistence)?,
                    ))
                })
                .collect::<QueueRepositoryResult<Vec<_>>>()?;
                let oldest = diesel::sql_query(
                    "SELECT MIN(created_at_ms) AS oldest_ms FROM task_queue WHERE status = 'queued'",
                )
                .get_result::<OldestQueuedRow>(connection)?;
                Ok(StoreStats {
                    counts,
                    oldest_queued_at: oldest.oldest_ms.map(from_ms).transpose()?,
                })
            })
            .await
    }

    async fn prune(&self, before: DateTime<Utc>) -> QueueRepositoryResult<PruneReport> {
        let cutoff = to_ms(before);
        self.engine
            .with_transaction(move |connection| {
                let doomed_filter = format!(
                    "SELECT id FROM task_queue WHERE status IN {TERMINAL_STATUSES} AND finished_at_ms < ?1"
                );
                let logs_of_doomed = diesel::sql_query(format!(
                    "DELETE FROM task_logs WHERE task_id IN ({doomed_filter})"
                ))
                .bind::<BigInt, _>(cutoff)
                .execute(connection)?;
                let old_logs = diesel::sql_query("DELETE FROM task_logs WHERE timestamp_ms < ?1")
                    .bind::<BigInt, _>(cutoff)
                    .execute(connection)?;
                let tasks_removed = diesel::sql_query(format!(
                    "DELETE FROM task_queue WHERE id IN ({doomed_filter})"
                ))
                .bind::<BigInt, _>(cutoff)
                .execute(connection)?;
                Ok(PruneReport {
                    tasks_removed: u64::try_from(tasks_removed)
                        .map_err(QueueRepositoryError::persistence)?,
                    logs_removed: u64::try_from(logs_of_doomed + old_logs)
                        .map_err(QueueRepositoryError::persistence)?,
                })
            })
            .await
    }
}

#[async_trait]
impl StorageMaintenance for SqliteQueueRepository {
    async fn checkpoint(&self) -> QueueRepositoryResult<()> {
        self.engine
            .with_connection(|connection| {
                connection.batch_execute("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
    }

    /// Writes a compacted copy of the database with `VACUUM INTO`.
    async fn backup_to(&self, destination: &Path) -> QueueRepositoryResult<()> {
        if destination.exists() {
            return Err(QueueRepositoryError::persistence(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("backup target exists: {}", destination.display()),
            )));
        }
        let target = destination.to_string_lossy().into_owned();
        self.engine
            .with_connection(move |connection| {
                diesel::sql_query("VACUUM INTO ?1")
                    .bind::<Text, _>(target.as_str())
                    .execute(connection)?;
                Ok(())
            })
            .await
    }

    fn backup_extension(&self) -> &'static str {
        "db"
    }
}

const fn order_by(order: CandidateOrder) -> &'static str {
    match order {
        CandidateOrder::OldestFirst => "q.created_at_ms ASC, q.id ASC",
        CandidateOrder::NewestFirst => "q.created_at_ms DESC, q.id DESC",
        CandidateOrder::PriorityFirst => "q.priority ASC, q.created_at_ms ASC, q.id ASC",
    }
}

fn to_new_row(task: &NewTask) -> QueueRepositoryResult<NewTaskRow> {
    Ok(NewTaskRow {
        task_type: task.task_type().as_str().to_owned(),
        priority: task.priority().value(),
        payload: task.payload().to_vec(),
        compatibility: tags_to_json(task.compatibility())?,
        status: TaskStatus::Queued.as_str().to_owned(),
        attempts: 0,
        max_attempts: count_to_i32(task.max_attempts())?,
        run_after_ms: to_ms(task.run_after()),
        idempotency_key: task.idempotency_key().map(|key| key.as_str().to_owned()),
        created_at_ms: to_ms(task.created_at()),
        updated_at_ms: to_ms(task.created_at()),
    })
}

fn load_task(connection: &mut SqliteConnection, id: TaskId) -> QueueRepositoryResult<Option<Task>> {
    task_queue::table
        .find(id.value())
        .select(TaskRow::as_select())
        .first::<TaskRow>(connection)
        .optional()?
        .map(row_to_task)
        .transpose()
}

fn load_worker(
    connection: &mut SqliteConnection,
    worker_id: &WorkerId,
) -> QueueRepositoryResult<Option<Worker>> {
    workers::table
        .find(worker_id.as_str())
        .select(WorkerRow::as_select())
        .first::<WorkerRow>(connection)
        .optional()?
        .map(row_to_worker)
        .transpose()
}

fn persist_task(connection: &mut SqliteConnection, task: &Task) -> QueueRepositoryResult<()> {
    let changeset = to_changeset(task)?;
    let updated = diesel::update(task_queue::table.find(task.id().value()))
        .set(&changeset)
        .execute(connection)?;
    if updated == 0 {
        return Err(QueueRepositoryError::NotFound(task.id()));
    }
    Ok(())
}

fn append_log(
    connection: &mut SqliteConnection,
    task_id: TaskId,
    timestamp: DateTime<Utc>,
    record: LogRecord,
) -> QueueRepositoryResult<()> {
    let row = NewTaskLogRow {
        task_id: task_id.value(),
        timestamp_ms: to_ms(timestamp),
        level: record.level().as_str().to_owned(),
        message: record.message().to_owned(),
        details: serde_json::to_string(record.details()).map_err(QueueRepositoryError::persistence)?,
    };
    diesel::insert_into(task_logs::table)
        .values(&row)
        .execute(connection)?;
    Ok(())
}

fn touch_or_register(
    connection: &mut SqliteConnection,
    request: &ClaimRequest,
    capabilities: Option<&str>,
) -> QueueRepositoryResult<()> {
    diesel::sql_query(concat!(
        "INSERT INTO workers (worker_id, capabilities, registered_at_ms, last_heartbeat_ms) ",
        "VALUES (?1, COALESCE(?2, '[]'), ?3, ?3) ",
        "ON CONFLICT (worker_id) DO UPDATE SET ",
        "capabilities = COALESCE(?2, workers.capabilities), ",
        "last_heartbeat_ms = MAX(workers.last_heartbeat_ms, excluded.last_heartbeat_ms)",
    ))
    .bind::<Text, _>(request.worker_id.as_str())
    .bind::<Nullable<Text>, _>(capabilities)
    .bind::<BigInt, _>(to_ms(request.now))
    .execute(connection)?;
    Ok(())
}
