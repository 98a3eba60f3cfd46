//! In-memory queue repository for tests and embedding.
//!
//! Every write takes the single state lock, so claims are serialised the
//! same way a write transaction serialises them in the durable store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{claimed_record, enqueued_record};
use crate::queue::{
    domain::{
        LogRecord, NewTask, Task, TaskFilter, TaskId, TaskLogEntry, TaskStatus, TaskType, Worker,
        WorkerId,
    },
    ports::{
        ClaimRequest, Enqueued, ExpiredLease, MutationEffect, MutationResult, PruneReport, QueueRepository,
        QueueRepositoryError, QueueRepositoryResult, StorageMaintenance, StoreStats, TaskMutation,
    },
    strategy::ClaimStrategy,
};

/// Thread-safe in-memory queue repository.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueRepository {
    state: Arc<RwLock<InMemoryQueueState>>,
}

#[derive(Debug, Default)]
struct InMemoryQueueState {
    last_task_id: i64,
    last_log_id: i64,
    tasks: BTreeMap<TaskId, Task>,
    idempotency_index: HashMap<String, TaskId>,
    workers: HashMap<WorkerId, Worker>,
    logs: Vec<TaskLogEntry>,
}

#[derive(Serialize)]
struct Snapshot<'a> {
    tasks: Vec<&'a Task>,
    workers: Vec<&'a Worker>,
    logs: &'a [TaskLogEntry],
}

impl InMemoryQueueState {
    fn append_log(&mut self, task_id: TaskId, timestamp: DateTime<Utc>, record: LogRecord) {
        self.last_log_id += 1;
        let entry = record.into_entry(self.last_log_id, task_id, timestamp);
        self.logs.push(entry);
    }

    fn touch_or_register(&mut self, request: &ClaimRequest) {
        if let Some(worker) = self.workers.get_mut(&request.worker_id) {
            worker.record_heartbeat(request.now);
            if let Some(capabilities) = &request.capabilities {
                worker.set_capabilities(capabilities.clone());
            }
            return;
        }
        let worker = Worker::new(
            request.worker_id.clone(),
            request.capabilities.clone().unwrap_or_default(),
            request.now,
        );
        self.workers.insert(request.worker_id.clone(), worker);
    }
}

impl InMemoryQueueRepository {
    /// Creates an empty in-memory repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> QueueRepositoryResult<RwLockReadGuard<'_, InMemoryQueueState>> {
        self.state.read().map_err(|err| {
            QueueRepositoryError::persistence(std::io::Error::other(err.to_string()))
        })
    }

    fn write(&self) -> QueueRepositoryResult<RwLockWriteGuard<'_, InMemoryQueueState>> {
        self.state.write().map_err(|err| {
            QueueRepositoryError::persistence(std::io::Error::other(err.to_string()))
        })
    }
}

fn claim_matches(task: &Task, request: &ClaimRequest) -> bool {
    task.is_eligible(request.now)
        && request
            .task_type
            .as_ref()
            .is_none_or(|task_type| task.task_type() == task_type)
        && request
            .capabilities
            .as_ref()
            .is_none_or(|capabilities| task.compatibility().is_satisfied_by(capabilities))
}

#[async_trait]
impl QueueRepository for InMemoryQueueRepository {
    async fn enqueue(&self, task: NewTask) -> QueueRepositoryResult<Enqueued> {
        let mut state = self.write()?;
        if let Some(key) = task.idempotency_key() {
            let existing = state
                .idempotency_index
                .get(key.as_str())
                .and_then(|id| state.tasks.get(id));
            if let Some(found) = existing {
                return Ok(Enqueued {
                    task: found.clone(),
                    created: false,
                });
            }
        }

        state.last_task_id += 1;
        let stored = task.into_task(TaskId::new(state.last_task_id));
        if let Some(key) = stored.idempotency_key() {
            state
                .idempotency_index
                .insert(key.as_str().to_owned(), stored.id());
        }
        state.append_log(stored.id(), stored.created_at(), enqueued_record(&stored));
        state.tasks.insert(stored.id(), stored.clone());
        Ok(Enqueued {
            task: stored,
            created: true,
        })
    }

    async fn find_by_id(&self, id: TaskId) -> QueueRepositoryResult<Option<Task>> {
        Ok(self.read()?.tasks.get(&id).cloned())
    }

    async fn list(&self, filter: &TaskFilter) -> QueueRepositoryResult<Vec<Task>> {
        let state = self.read()?;
        let skip = usize::try_from(filter.offset()).map_err(QueueRepositoryError::persistence)?;
        let take = usize::try_from(filter.limit()).map_err(QueueRepositoryError::persistence)?;
        Ok(state
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .skip(skip)
            .take(take)
            .cloned()
            .collect())
    }

    async fn mutate(
        &self,
        id: TaskId,
        mutation: TaskMutation,
    ) -> QueueRepositoryResult<MutationResult> {
        let mut state = self.write()?;
        let mut task = state
            .tasks
            .get(&id)
            .cloned()
            .ok_or(QueueRepositoryError::NotFound(id))?;
        match mutation(&mut task)? {
            MutationEffect::Unchanged => {
                return Ok(MutationResult {
                    task,
                    changed: false,
                });
            }
            MutationEffect::Updated => {}
            MutationEffect::Logged(record) => state.append_log(id, task.updated_at(), record),
        }
        state.tasks.insert(id, task.clone());
        Ok(MutationResult {
            task,
            changed: true,
        })
    }

    async fn claim_next(
        &self,
        request: ClaimRequest,
        strategy: Arc<dyn ClaimStrategy>,
    ) -> QueueRepositoryResult<Option<Task>> {
        let mut state = self.write()?;
        let order = strategy.ordering();
        let mut eligible: Vec<&Task> = state
            .tasks
            .values()
            .filter(|task| claim_matches(task, &request))
            .collect();
        eligible.sort_by(|left, right| order.compare(left, right));
        let candidates: Vec<Task> = eligible
            .into_iter()
            .take(strategy.window())
            .cloned()
            .collect();
        let Some(chosen) = strategy.select_candidate(&candidates) else {
            state.touch_or_register(&request);
            return Ok(None);
        };

        let mut task = chosen.clone();
        task.lease_to(request.worker_id.clone(), request.lease_until, request.now)?;
        state.append_log(task.id(), request.now, claimed_record(&task));
        state.tasks.insert(task.id(), task.clone());
        state.touch_or_register(&request);
        Ok(Some(task))
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        orphan_before: DateTime<Utc>,
    ) -> QueueRepositoryResult<Vec<ExpiredLease>> {
        let state = self.read()?;
        let expired = state
            .tasks
            .values()
            .filter(|task| task.lease_expired(now))
            .filter_map(|task| {
                let lease = task.lease()?;
                let worker_gone = state
                    .workers
                    .get(lease.worker_id())
                    .is_none_or(|worker| worker.is_stale(stale_before));
                let orphaned = lease.lease_until() < orphan_before;
                (worker_gone || orphaned).then(|| ExpiredLease {
                    task_id: task.id(),
                    worker_id: lease.worker_id().clone(),
                })
            })
            .collect();
        Ok(expired)
    }

    async fn upsert_worker(&self, worker: Worker) -> QueueRepositoryResult<Worker> {
        let mut state = self.write()?;
        let stored = match state.workers.get(worker.worker_id()) {
            Some(existing) => Worker::from_persisted(
                worker.worker_id().clone(),
                worker.capabilities().clone(),
                existing.registered_at(),
                worker.last_heartbeat().max(existing.last_heartbeat()),
            ),
            None => worker,
        };
        state
            .workers
            .insert(stored.worker_id().clone(), stored.clone());
        Ok(stored)
    }

    async fn touch_worker(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> QueueRepositoryResult<bool> {
        let mut state = self.write()?;
        let Some(worker) = state.workers.get_mut(worker_id) else {
            return Ok(false);
        };
        worker.record_heartbeat(now);
        Ok(true)
    }

    async fn find_worker(&self, worker_id: &WorkerId) -> QueueRepositoryResult<Option<Worker>> {
        Ok(self.read()?.workers.get(worker_id).cloned())
    }

    async fn task_logs(&self, id: TaskId) -> QueueRepositoryResult<Vec<TaskLogEntry>> {
        Ok(self
            .read()?
            .logs
            .iter()
            .filter(|entry| entry.task_id == id)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> QueueRepositoryResult<StoreStats> {
        let state = self.read()?;
        let mut counts: BTreeMap<(TaskType, TaskStatus), u64> = BTreeMap::new();
        for task in state.tasks.values() {
            *counts
                .entry((task.task_type().clone(), task.status()))
                .or_default() += 1;
        }
        let oldest_queued_at = state
            .tasks
            .values()
            .filter(|task| task.status() == TaskStatus::Queued)
            .map(Task::created_at)
            .min();
        Ok(StoreStats {
            counts: counts
                .into_iter()
                .map(|((task_type, status), count)| (task_type, status, count))
                .collect(),
            oldest_queued_at,
        })
    }

    async fn prune(&self, before: DateTime<Utc>) -> QueueRepositoryResult<PruneReport> {
        let mut state = self.write()?;
        let doomed: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|task| {
                task.status().is_terminal()
                    && task.finished_at().is_some_and(|finished| finished < before)
            })
            .map(Task::id)
            .collect();
        for id in &doomed {
            let removed = state.tasks.remove(id);
            if let Some(key) = removed.as_ref().and_then(Task::idempotency_key) {
                state.idempotency_index.remove(key.as_str());
            }
        }

        let logs_before = state.logs.len();
        state
            .logs
            .retain(|entry| entry.timestamp >= before && !doomed.contains(&entry.task_id));
        let logs_removed = logs_before.saturating_sub(state.logs.len());

        Ok(PruneReport {
            tasks_removed: u64::try_from(doomed.len()).map_err(QueueRepositoryError::persistence)?,
            logs_removed: u64::try_from(logs_removed).map_err(QueueRepositoryError::persistence)?,
        })
    }
}

#[async_trait]
impl StorageMaintenance for InMemoryQueueRepository {
    async fn checkpoint(&self) -> QueueRepositoryResult<()> {
        Ok(())
    }

    /// Writes a JSON snapshot of every task, worker and log entry.
    async fn backup_to(&self, destination: &Path) -> QueueRepositoryResult<()> {
        let bytes = {
            let state = self.read()?;
            let snapshot = Snapshot {
                tasks: state.tasks.values().collect(),
                workers: state.workers.values().collect(),
                logs: &state.logs,
            };
            serde_json::to_vec_pretty(&snapshot).map_err(QueueRepositoryError::persistence)?
        };
        let path = destination.to_path_buf();
        tokio::task::spawn_blocking(move || {
            use std::io::Write as _;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)?;
            file.write_all(&bytes)?;
            file.sync_all()
        })
        .await
        .map_err(QueueRepositoryError::persistence)?
        .map_err(QueueRepositoryError::persistence)
    }

    fn backup_extension(&self) -> &'static str {
        "json"
    }
}
