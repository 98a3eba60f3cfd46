//! SQLite storage engine: connection pool, pragmas, schema and the
//! transaction primitives the repository builds on.

use crate::config::StorageConfig;
use crate::queue::domain::BackoffPolicy;
use crate::queue::ports::{QueueRepositoryError, QueueRepositoryResult};
use chrono::Utc;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::result::Error as DieselError;
use diesel::sql_types::{BigInt, Integer};
use diesel::sqlite::SqliteConnection;
use tracing::{debug, warn};

/// SQLite connection pool type used by queue adapters.
pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

type PooledConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Schema version written by this build.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY NOT NULL,
    applied_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    payload BLOB NOT NULL,
    compatibility TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL CHECK (status IN ('queued', 'leased', 'completed', 'failed', 'cancelled')),
    attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    max_attempts INTEGER NOT NULL CHECK (max_attempts >= 1),
    run_after_ms INTEGER NOT NULL,
    lease_until_ms INTEGER,
    locked_by TEXT,
    reserved_at_ms INTEGER,
    idempotency_key TEXT,
    error_message TEXT,
    task_result BLOB,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    finished_at_ms INTEGER,
    CHECK (attempts <= max_attempts),
    CHECK ((status = 'leased') = (locked_by IS NOT NULL AND lease_until_ms IS NOT NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_task_queue_idempotency_key
    ON task_queue (idempotency_key) WHERE idempotency_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_task_queue_claim_priority
    ON task_queue (status, priority, run_after_ms, id);
CREATE INDEX IF NOT EXISTS idx_task_queue_claim_age
    ON task_queue (status, created_at_ms, id);
CREATE INDEX IF NOT EXISTS idx_task_queue_type_status
    ON task_queue (task_type, status);
CREATE INDEX IF NOT EXISTS idx_task_queue_lease
    ON task_queue (status, lease_until_ms);

CREATE TABLE IF NOT EXISTS task_tags (
    task_id INTEGER NOT NULL REFERENCES task_queue (id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    PRIMARY KEY (task_id, tag)
);
CREATE INDEX IF NOT EXISTS idx_task_tags_tag ON task_tags (tag, task_id);

CREATE TABLE IF NOT EXISTS workers (
    worker_id TEXT PRIMARY KEY NOT NULL,
    capabilities TEXT NOT NULL DEFAULT '[]',
    registered_at_ms INTEGER NOT NULL,
    last_heartbeat_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES task_queue (id) ON DELETE CASCADE,
    timestamp_ms INTEGER NOT NULL,
    level TEXT NOT NULL CHECK (level IN ('debug', 'info', 'warn', 'error')),
    message TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT 'null'
);
CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs (task_id, id);
CREATE INDEX IF NOT EXISTS idx_task_logs_timestamp ON task_logs (timestamp_ms);
";

/// Pragmas applied to every pooled connection on checkout.
#[derive(Debug, Clone, Copy)]
struct ConnectionPragmas {
    busy_timeout_ms: u64,
    cache_size_kib: u32,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, connection: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        connection
            .batch_execute(&format!(
                "PRAGMA busy_timeout = {}; PRAGMA synchronous = NORMAL; \
                 PRAGMA foreign_keys = ON; PRAGMA cache_size = -{};",
                self.busy_timeout_ms, self.cache_size_kib
            ))
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

#[derive(diesel::QueryableByName)]
struct VersionRow {
    #[diesel(sql_type = diesel::sql_types::Nullable<Integer>)]
    version: Option<i32>,
}

/// Owns the connection pool and runs closures inside transactions with
/// busy retry.
#[derive(Clone)]
pub struct StorageEngine {
    pool: SqlitePool,
    busy_retries: u32,
    busy_backoff: BackoffPolicy,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("pool_state", &self.pool.state())
            .field("busy_retries", &self.busy_retries)
            .finish_non_exhaustive()
    }
}

impl StorageEngine {
    /// Opens (creating if needed) the database at `config.path`, switches it
    /// to WAL mode, initialises the schema and builds the pool.
    ///
    /// # Errors
    ///
    /// Returns [`QueueRepositoryError::Persistence`] when the file cannot be
    /// opened, the schema cannot be applied, or the file was written by a
    /// newer schema version.
    pub fn open(config: &StorageConfig) -> QueueRepositoryResult<Self> {
        if let Some(parent) = config.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(QueueRepositoryError::persistence)?;
        }
        let url = config.path.to_string_lossy().into_owned();

        let mut bootstrap = SqliteConnection::establish(&url).map_err(QueueRepositoryError::persistence)?;
        bootstrap.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA page_size = {}; PRAGMA journal_mode = WAL;",
            config.busy_timeout_ms, config.page_size
        ))?;
        initialise_schema(&mut bootstrap)?;
        drop(bootstrap);

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_customizer(Box::new(ConnectionPragmas {
                busy_timeout_ms: config.busy_timeout_ms,
                cache_size_kib: config.cache_size_kib,
            }))
            .build(ConnectionManager::<SqliteConnection>::new(url))
            .map_err(QueueRepositoryError::persistence)?;

        debug!(path = %config.path.display(), pool_size = config.pool_size, "storage opened");
        Ok(Self {
            pool,
            busy_retries: config.busy_retries.max(1),
            busy_backoff: config.busy_backoff(),
        })
    }

    /// Runs `f` inside `BEGIN IMMEDIATE`, so at most one writer proceeds at
    /// a time. Any error rolls the transaction back. Busy errors are retried
    /// with jittered backoff and reported as
    /// [`QueueRepositoryError::Busy`] once retries run out.
    pub async fn with_transaction<F, T>(&self, f: F) -> QueueRepositoryResult<T>
    where
        F: Fn(&mut SqliteConnection) -> QueueRepositoryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run_with_retry(move |connection| connection.immediate_transaction(&f))
            .await
    }

    /// Runs `f` inside a deferred transaction. Under WAL, readers see a
    /// consistent snapshot and never wait for the writer.
    pub async fn with_read_only<F, T>(&self, f: F) -> QueueRepositoryResult<T>
    where
        F: Fn(&mut SqliteConnection) -> QueueRepositoryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run_with_retry(move |connection| connection.transaction(&f))
            .await
    }

    /// Runs `f` on a connection outside any transaction, for statements
    /// SQLite refuses inside one (checkpoint, `VACUUM INTO`).
    pub async fn with_connection<F, T>(&self, f: F) -> QueueRepositoryResult<T>
    where
        F: Fn(&mut SqliteConnection) -> QueueRepositoryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run_with_retry(f).await
    }

    async fn run_with_retry<F, T>(&self, f: F) -> QueueRepositoryResult<T>
    where
        F: Fn(&mut SqliteConnection) -> QueueRepositoryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let retries = self.busy_retries;
        let backoff = self.busy_backoff;
        tokio::task::spawn_blocking(move || {
            let mut connection = checkout(&pool)?;
            let mut attempt = 1;
            loop {
                match f(&mut connection) {
                    Err(err) if is_busy(&err) && attempt < retries => {
                        let delay = backoff.delay(attempt);
                        debug!(attempt, ?delay, "store busy, retrying");
                        std::thread::sleep(delay);
                        attempt += 1;
                    }
                    Err(err) if is_busy(&err) => {
                        warn!(attempts = attempt, "store busy, giving up");
                        return Err(QueueRepositoryError::Busy { attempts: attempt });
                    }
                    outcome => return outcome,
                }
            }
        })
        .await
        .map_err(QueueRepositoryError::persistence)?
    }
}

fn checkout(pool: &SqlitePool) -> QueueRepositoryResult<PooledConn> {
    pool.get().map_err(QueueRepositoryError::persistence)
}

fn initialise_schema(connection: &mut SqliteConnection) -> QueueRepositoryResult<()> {
    connection.immediate_transaction(|conn| {
        conn.batch_execute(SCHEMA_SQL)?;
        let stored = diesel::sql_query("SELECT MAX(version) AS version FROM schema_version")
            .get_result::<VersionRow>(conn)?
            .version;
        match stored {
            Some(version) if version > SCHEMA_VERSION => {
                Err(QueueRepositoryError::persistence(std::io::Error::other(format!(
                    "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
                ))))
            }
            Some(version) if version == SCHEMA_VERSION => Ok(()),
            _ => {
                diesel::sql_query(
                    "INSERT INTO schema_version (version, applied_at_ms) VALUES (?1, ?2)",
                )
                .bind::<Integer, _>(SCHEMA_VERSION)
                .bind::<BigInt, _>(Utc::now().timestamp_millis())
                .execute(conn)?;
                Ok(())
            }
        }
    })
}

/// Returns whether an error reports SQLite lock contention.
pub(super) fn is_busy(err: &QueueRepositoryError) -> bool {
    match err {
        QueueRepositoryError::Persistence(source) => {
            let message = source.to_string().to_ascii_lowercase();
            message.contains("database is locked") || message.contains("database is busy")
        }
        QueueRepositoryError::Busy { .. } => true,
        QueueRepositoryError::NotFound(_) | QueueRepositoryError::Domain(_) => false,
    }
}

impl From<DieselError> for QueueRepositoryError {
    fn from(err: DieselError) -> Self {
        Self::persistence(err)
    }
}
