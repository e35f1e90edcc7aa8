//! Embedded analytics store: schema migrations, transactional batch writes
//! with per-record salvage, bounded read queries, the safe ad-hoc query
//! gate, snapshots, and the retention cleaner.

mod error;
mod gate;
mod migrations;
mod read;
mod retention;
mod snapshot;

pub use error::StoreError;
pub use retention::RetentionCleaner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};

use crate::model::{BatchInsert, LogRecord, next_event_id};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file path. `None` opens an in-memory store (snapshot
    /// disabled).
    pub db_path: Option<PathBuf>,
    /// Per-read deadline.
    pub query_timeout: Duration,
    /// Global read-slot cap; 0 disables the throttle.
    pub max_concurrent_queries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            query_timeout: Duration::from_secs(30),
            max_concurrent_queries: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Single-writer store over an embedded SQLite database.
///
/// Writes (batch insert, retention delete, checkpoint) take the exclusive
/// lock; reads take the shared lock plus an optional global read slot and
/// run under the configured deadline.
pub struct Store {
    pool: SqlitePool,
    write_lock: RwLock<()>,
    query_timeout: Duration,
    read_slots: Option<Arc<Semaphore>>,
    db_path: Option<PathBuf>,
}

impl Store {
    /// Open the database, apply migrations, and return the store.
    #[tracing::instrument(skip(config), err)]
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let pool = match &config.db_path {
            Some(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .busy_timeout(Duration::from_secs(5));
                // Capped pool: single-writer semantics need few connections.
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .min_connections(2)
                    .connect_with(options)
                    .await?
            }
            None => {
                // An in-memory database exists per connection, so the pool
                // is pinned to exactly one that never retires.
                let options = SqliteConnectOptions::new().in_memory(true);
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await?
            }
        };

        migrations::run(&pool).await?;
        tracing::info!(
            in_memory = config.db_path.is_none(),
            "store opened and migrated"
        );

        let read_slots = if config.max_concurrent_queries > 0 {
            Some(Arc::new(Semaphore::new(config.max_concurrent_queries)))
        } else {
            None
        };

        Ok(Self {
            pool,
            write_lock: RwLock::new(()),
            query_timeout: config.query_timeout,
            read_slots,
            db_path: config.db_path,
        })
    }

    /// Applied migration state: `(current_version, pending_count)`.
    pub async fn migration_status(&self) -> Result<(i64, usize), StoreError> {
        migrations::status(&self.pool).await
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Insert a batch of records in one transaction.
    ///
    /// On a batch failure every record is salvaged individually; records
    /// that fail alone are dropped and logged. Errors surface only for
    /// infrastructural failures during salvage setup.
    #[tracing::instrument(skip(self, records), fields(count = records.len()), err)]
    pub async fn insert_log_batch(&self, records: &[LogRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.write().await;

        match self.insert_all(records).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    count = records.len(),
                    "batch insert failed, salvaging records individually"
                );
                self.salvage(records).await
            }
        }
    }

    async fn insert_all(&self, records: &[LogRecord]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            exec_insert(&mut *tx, record).await?;
        }
        tx.commit().await
    }

    async fn salvage(&self, records: &[LogRecord]) -> Result<(), StoreError> {
        let mut dropped = 0usize;
        for record in records {
            let mut tx = self.pool.begin().await?;
            match exec_insert(&mut *tx, record).await {
                Ok(()) => tx.commit().await?,
                Err(e) => {
                    let _ = tx.rollback().await;
                    dropped += 1;
                    tracing::warn!(
                        error = %e,
                        line = %truncate(&record.raw_line, 200),
                        "dropping unsalvageable record"
                    );
                }
            }
        }
        if dropped > 0 {
            tracing::warn!(dropped, total = records.len(), "salvage dropped records");
        }
        Ok(())
    }

    /// Delete rows older than the retention horizon. Takes the write lock.
    pub(crate) async fn delete_older_than(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock.write().await;
        let result = sqlx::query("DELETE FROM logs WHERE timestamp < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // -----------------------------------------------------------------------
    // Read plumbing
    // -----------------------------------------------------------------------

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) async fn read_slot(&self) -> Result<Option<OwnedSemaphorePermit>, StoreError> {
        match &self.read_slots {
            Some(sem) => Ok(Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| StoreError::Closed)?,
            )),
            None => Ok(None),
        }
    }

    pub(crate) async fn read_guard(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.write_lock.read().await
    }

    pub(crate) async fn write_guard(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.write_lock.write().await
    }

    pub(crate) fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    /// Bound a read future by the configured deadline.
    pub(crate) async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.query_timeout)),
        }
    }
}

#[async_trait]
impl BatchInsert for Store {
    async fn insert_batch(&self, records: &[LogRecord]) -> anyhow::Result<()> {
        self.insert_log_batch(records).await.map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Row binding
// ---------------------------------------------------------------------------

async fn exec_insert<'e, E>(executor: E, record: &LogRecord) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let attributes = match serde_json::to_string(&record.attributes) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "failed to marshal attributes, storing {{}}");
            "{}".to_string()
        }
    };
    let app = if record.app.is_empty() {
        "default"
    } else {
        record.app.as_str()
    };
    let event_id = if record.event_id.is_empty() {
        next_event_id()
    } else {
        record.event_id.clone()
    };

    sqlx::query(
        r"
        INSERT INTO logs (timestamp, orig_timestamp, level, level_num, message, raw_line,
                          service, hostname, pid, attributes, source, app, event_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ",
    )
    .bind(record.timestamp)
    .bind(record.orig_timestamp)
    .bind(&record.level)
    .bind(record.level_num)
    .bind(&record.message)
    .bind(&record.raw_line)
    .bind(&record.service)
    .bind(&record.hostname)
    .bind(record.pid)
    .bind(attributes)
    .bind(&record.source)
    .bind(app)
    .bind(event_id)
    .execute(executor)
    .await?;
    Ok(())
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
