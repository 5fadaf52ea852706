// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Embedded-file dialect.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database file is
//! contended (another process, or a checkpoint in progress). That is local
//! lock contention rather than a connectivity failure, so it is retried
//! here with exponential backoff. Every other error goes to the caller.
//!
//! `:memory:` databases live on a single pooled connection that is never
//! recycled, otherwise the data would vanish with the connection.

use super::{count_to_sql, fetch_result_from_rows, record_from_row, QueueRow, RecordRow};
use crate::config::StorageConfig;
use crate::error::{AltError, Result};
use crate::record::{now_millis, DeleteKey, FetchResult, PlayerData};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const MEMORY_PATH: &str = ":memory:";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Durable store on an embedded SQLite file.
pub struct SqliteStore {
    pool: SqlitePool,
    data_table: String,
    queue_table: String,
    fetch_batch_size: i64,
    wal_mode: bool,
    path: String,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path`.
    pub async fn open(path: &str, wal_mode: bool, config: &StorageConfig) -> Result<Self> {
        info!(path = %path, wal_mode, "Opening SQLite store");

        let in_memory = path == MEMORY_PATH;
        let wal_mode = wal_mode && !in_memory;

        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| AltError::Config(format!("Invalid SQLite path: {}", e)))?
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        };
        let options = options
            .journal_mode(if wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            })
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.pool_size.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| AltError::Config(format!("cannot open SQLite store at {}: {}", path, e)))?;

        Ok(Self {
            pool,
            data_table: config.data_table(),
            queue_table: config.queue_table(),
            fetch_batch_size: i64::from(config.fetch_batch_size.max(1)),
            wal_mode,
            path: path.to_string(),
        })
    }

    pub async fn initialize_schema(&self) -> Result<()> {
        let data = &self.data_table;
        let queue = &self.queue_table;
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {data} (
                    uuid TEXT NOT NULL,
                    ip TEXT NOT NULL,
                    count INTEGER NOT NULL,
                    server TEXT NOT NULL,
                    created INTEGER NOT NULL,
                    updated INTEGER NOT NULL,
                    PRIMARY KEY (uuid, ip)
                )
                "#
            ),
            format!("CREATE INDEX IF NOT EXISTS {data}_ip ON {data} (ip)"),
            format!("CREATE INDEX IF NOT EXISTS {data}_updated ON {data} (updated)"),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {queue} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL,
                    ip TEXT NOT NULL,
                    count INTEGER NOT NULL,
                    server TEXT NOT NULL,
                    created INTEGER NOT NULL,
                    updated INTEGER NOT NULL,
                    queued INTEGER NOT NULL
                )
                "#
            ),
            format!("CREATE INDEX IF NOT EXISTS {queue}_queued ON {queue} (queued)"),
        ];

        for sql in &statements {
            let pool = self.pool.clone();
            execute_with_retry("initialize_schema", move || {
                let pool = pool.clone();
                let sql = sql.clone();
                async move { sqlx::query(&sql).execute(&pool).await }
            })
            .await?;
        }

        debug!(data = %data, queue = %queue, "SQLite schema ready");
        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<PlayerData>> {
        let sql = format!(
            "SELECT uuid, ip, count, server, created, updated FROM {}",
            self.data_table
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().filter_map(record_from_row).collect())
    }

    pub async fn fetch_dirty(&self, checkpoint: i64) -> Result<FetchResult> {
        let sql = format!(
            "SELECT id, uuid, ip, count, server, created, updated FROM {} \
             WHERE id > ? ORDER BY id ASC LIMIT ?",
            self.queue_table
        );
        let pool = self.pool.clone();
        let limit = self.fetch_batch_size;
        let rows: Vec<QueueRow> = execute_with_retry("fetch_dirty", move || {
            let pool = pool.clone();
            let sql = sql.clone();
            async move {
                sqlx::query_as(&sql)
                    .bind(checkpoint)
                    .bind(limit)
                    .fetch_all(&pool)
                    .await
            }
        })
        .await?;
        Ok(fetch_result_from_rows(rows, checkpoint))
    }

    pub async fn upsert(&self, record: &PlayerData) -> Result<PlayerData> {
        let data = &self.data_table;
        let upsert_sql = format!(
            r#"
            INSERT INTO {data} (uuid, ip, count, server, created, updated)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(uuid, ip) DO UPDATE SET
                server = CASE
                    WHEN excluded.updated > {data}.updated
                      OR (excluded.updated = {data}.updated AND excluded.count > {data}.count)
                    THEN excluded.server ELSE {data}.server END,
                count = CASE
                    WHEN excluded.updated > {data}.updated THEN MAX(excluded.count, {data}.count + 1)
                    ELSE MAX(excluded.count, {data}.count) END,
                created = MIN({data}.created, excluded.created),
                updated = MAX({data}.updated, excluded.updated)
            "#
        );
        let select_sql = format!(
            "SELECT uuid, ip, count, server, created, updated FROM {data} WHERE uuid = ? AND ip = ?"
        );
        let queue_sql = format!(
            "INSERT INTO {} (uuid, ip, count, server, created, updated, queued) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.queue_table
        );

        let pool = self.pool.clone();
        let record = record.clone();
        let row: RecordRow = execute_with_retry("upsert", move || {
            let pool = pool.clone();
            let record = record.clone();
            let upsert_sql = upsert_sql.clone();
            let select_sql = select_sql.clone();
            let queue_sql = queue_sql.clone();
            async move {
                let uuid = record.uuid.hyphenated().to_string();
                let mut tx = pool.begin().await?;

                sqlx::query(&upsert_sql)
                    .bind(&uuid)
                    .bind(&record.ip)
                    .bind(count_to_sql(record.count))
                    .bind(&record.server)
                    .bind(record.created)
                    .bind(record.updated)
                    .execute(&mut *tx)
                    .await?;

                let merged: RecordRow = sqlx::query_as(&select_sql)
                    .bind(&uuid)
                    .bind(&record.ip)
                    .fetch_one(&mut *tx)
                    .await?;

                sqlx::query(&queue_sql)
                    .bind(&merged.0)
                    .bind(&merged.1)
                    .bind(merged.2)
                    .bind(&merged.3)
                    .bind(merged.4)
                    .bind(merged.5)
                    .bind(now_millis())
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;
                Ok::<_, sqlx::Error>(merged)
            }
        })
        .await?;

        record_from_row(row)
            .ok_or_else(|| AltError::Internal("merged row failed validation".to_string()))
    }

    pub async fn delete(&self, key: &DeleteKey) -> Result<u64> {
        let (column, value) = match key {
            DeleteKey::Identity(uuid) => ("uuid", uuid.hyphenated().to_string()),
            DeleteKey::Address(ip) => ("ip", ip.clone()),
        };
        let data_sql = format!("DELETE FROM {} WHERE {} = ?", self.data_table, column);
        let queue_sql = format!("DELETE FROM {} WHERE {} = ?", self.queue_table, column);

        let pool = self.pool.clone();
        let removed = execute_with_retry("delete", move || {
            let pool = pool.clone();
            let value = value.clone();
            let data_sql = data_sql.clone();
            let queue_sql = queue_sql.clone();
            async move {
                let mut tx = pool.begin().await?;
                let removed = sqlx::query(&data_sql)
                    .bind(&value)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                sqlx::query(&queue_sql).bind(&value).execute(&mut *tx).await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(removed)
            }
        })
        .await?;

        info!(key = %key, removed, "Deleted rows from SQLite store");
        Ok(removed)
    }

    pub async fn latest_checkpoint(&self) -> Result<i64> {
        let sql = format!("SELECT COALESCE(MAX(id), 0) FROM {}", self.queue_table);
        let checkpoint: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(checkpoint)
    }

    pub async fn prune_queue(&self, cutoff_millis: i64) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE queued < ?", self.queue_table);
        let pool = self.pool.clone();
        let pruned = execute_with_retry("prune_queue", move || {
            let pool = pool.clone();
            let sql = sql.clone();
            async move {
                sqlx::query(&sql)
                    .bind(cutoff_millis)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
            }
        })
        .await?;
        Ok(pruned)
    }

    /// Force flush WAL to main database (for clean shutdown).
    async fn wal_checkpoint(&self) -> Result<()> {
        let pool = self.pool.clone();
        execute_with_retry("wal_checkpoint", move || {
            let pool = pool.clone();
            async move {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                    .execute(&pool)
                    .await
            }
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool. Idempotent.
    pub async fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        if self.wal_mode {
            if let Err(e) = self.wal_checkpoint().await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
        }
        self.pool.close().await;
        info!(path = %self.path, "SQLite store closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
