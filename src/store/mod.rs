// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable store: the SQL source of truth.
//!
//! Two dialects share one contract and are selected once from config:
//!
//! | Dialect | Backend | Use |
//! |---------|---------|-----|
//! | [`SqliteStore`] | Embedded file | Single server, no shared database |
//! | [`MysqlStore`] | Networked | Many servers sharing one database |
//!
//! # Tables
//!
//! ```text
//! {prefix}data   PRIMARY KEY (uuid, ip)   one row per sighting pair
//! {prefix}queue  id AUTOINCREMENT         merged row appended on every upsert
//! ```
//!
//! The queue id is the replication checkpoint: [`PlayerStore::fetch_dirty`]
//! returns queued rows with `id > checkpoint` in id order. Writers append
//! inside the same transaction as the data upsert, so a committed row is
//! always visible to the next fetch.
//!
//! # Failure Semantics
//!
//! Connectivity and timeout errors are returned to the caller as
//! [`AltError::Store`](crate::AltError::Store). The store does not retry
//! them itself; the sync loop tries again on its next tick. The SQLite
//! dialect does retry local lock contention (SQLITE_BUSY/SQLITE_LOCKED).

mod mysql;
mod sqlite;

pub use mysql::MysqlStore;
pub use sqlite::SqliteStore;

use crate::config::{SqlDialect, StorageConfig};
use crate::error::{AltError, Result};
use crate::metrics;
use crate::record::{DeleteKey, FetchResult, PlayerData};
use std::future::Future;
use std::time::Instant;
use tracing::warn;

/// Column tuple shared by the data and queue tables:
/// `(uuid, ip, count, server, created, updated)`.
pub(crate) type RecordRow = (String, String, i64, String, i64, i64);

/// Queue row: checkpoint id followed by the record columns.
pub(crate) type QueueRow = (i64, String, String, i64, String, i64, i64);

/// Convert a SQL row back into a record.
///
/// Rows that fail validation (written by an older or foreign client) are
/// skipped with a warning rather than failing the whole load.
pub(crate) fn record_from_row(row: RecordRow) -> Option<PlayerData> {
    let (uuid, ip, count, server, created, updated) = row;
    let count = u64::try_from(count).unwrap_or(1);
    match PlayerData::from_parts(&uuid, &ip, count, server, created, updated) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(uuid = %uuid, ip = %ip, error = %e, "Skipping invalid stored row");
            None
        }
    }
}

/// Build a fetch result from queue rows, advancing the checkpoint past every
/// row returned (including ones skipped as invalid).
pub(crate) fn fetch_result_from_rows(rows: Vec<QueueRow>, checkpoint: i64) -> FetchResult {
    let mut next = checkpoint;
    let mut records = Vec::with_capacity(rows.len());
    for (id, uuid, ip, count, server, created, updated) in rows {
        next = next.max(id);
        if let Some(record) = record_from_row((uuid, ip, count, server, created, updated)) {
            records.push(record);
        }
    }
    FetchResult {
        rows: records,
        checkpoint: next,
    }
}

/// Counts are `u64` in memory and signed 64-bit in SQL.
pub(crate) fn count_to_sql(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

/// Run a store operation and record its outcome and latency.
async fn timed<T, Fut>(dialect: &'static str, operation: &'static str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = fut.await;
    metrics::record_store_op(dialect, operation, result.is_ok(), start.elapsed());
    result
}

/// The durable store, dispatching to the configured dialect.
pub enum PlayerStore {
    Sqlite(SqliteStore),
    Mysql(MysqlStore),
}

impl PlayerStore {
    /// Open the store described by `config`. Does not create tables;
    /// call [`initialize_schema`](Self::initialize_schema) next.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        config.validate().map_err(AltError::Config)?;
        match &config.dialect {
            SqlDialect::Sqlite { path, wal_mode } => {
                Ok(Self::Sqlite(SqliteStore::open(path, *wal_mode, config).await?))
            }
            SqlDialect::Mysql { url } => Ok(Self::Mysql(MysqlStore::open(url, config).await?)),
        }
    }

    /// Dialect name for logs and metrics.
    pub fn dialect(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Mysql(_) => "mysql",
        }
    }

    /// Create tables and indexes if absent. Safe to call on every start.
    pub async fn initialize_schema(&self) -> Result<()> {
        match self {
            Self::Sqlite(s) => timed("sqlite", "initialize_schema", s.initialize_schema()).await,
            Self::Mysql(s) => timed("mysql", "initialize_schema", s.initialize_schema()).await,
        }
    }

    /// Full snapshot of the data table.
    pub async fn load_all(&self) -> Result<Vec<PlayerData>> {
        match self {
            Self::Sqlite(s) => timed("sqlite", "load_all", s.load_all()).await,
            Self::Mysql(s) => timed("mysql", "load_all", s.load_all()).await,
        }
    }

    /// Queued rows after `checkpoint`, ascending, at most `fetch_batch_size`.
    ///
    /// An empty batch keeps the checkpoint unchanged.
    pub async fn fetch_dirty(&self, checkpoint: i64) -> Result<FetchResult> {
        match self {
            Self::Sqlite(s) => timed("sqlite", "fetch_dirty", s.fetch_dirty(checkpoint)).await,
            Self::Mysql(s) => timed("mysql", "fetch_dirty", s.fetch_dirty(checkpoint)).await,
        }
    }

    /// Insert or merge `record`, queue the merged row and return it.
    ///
    /// On conflict the incoming row wins `server` and `updated` if it is
    /// newer (or equally new with a higher count). The count never drops: a
    /// newer incoming row is a repeat sighting and ends at least at
    /// `stored + 1`, and an older one from a lagging clock still lifts the
    /// count to its own.
    pub async fn upsert(&self, record: &PlayerData) -> Result<PlayerData> {
        match self {
            Self::Sqlite(s) => timed("sqlite", "upsert", s.upsert(record)).await,
            Self::Mysql(s) => timed("mysql", "upsert", s.upsert(record)).await,
        }
    }

    /// Remove every row matching `key` from data and queue. Returns the
    /// number of data rows removed.
    pub async fn delete(&self, key: &DeleteKey) -> Result<u64> {
        match self {
            Self::Sqlite(s) => timed("sqlite", "delete", s.delete(key)).await,
            Self::Mysql(s) => timed("mysql", "delete", s.delete(key)).await,
        }
    }

    /// Highest queue id, or 0 for an empty queue.
    pub async fn latest_checkpoint(&self) -> Result<i64> {
        match self {
            Self::Sqlite(s) => timed("sqlite", "latest_checkpoint", s.latest_checkpoint()).await,
            Self::Mysql(s) => timed("mysql", "latest_checkpoint", s.latest_checkpoint()).await,
        }
    }

    /// Delete queue entries queued before `cutoff_millis`.
    pub async fn prune_queue(&self, cutoff_millis: i64) -> Result<u64> {
        match self {
            Self::Sqlite(s) => timed("sqlite", "prune_queue", s.prune_queue(cutoff_millis)).await,
            Self::Mysql(s) => timed("mysql", "prune_queue", s.prune_queue(cutoff_millis)).await,
        }
    }

    /// Close the pool. Later calls fail with a store error.
    pub async fn close(&self) {
        match self {
            Self::Sqlite(s) => s.close().await,
            Self::Mysql(s) => s.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Sqlite(s) => s.is_closed(),
            Self::Mysql(s) => s.is_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYER: &str = "a1b2c3d4-0000-4000-8000-000000000001";

    fn row(uuid: &str, ip: &str) -> RecordRow {
        (uuid.to_string(), ip.to_string(), 2, "lobby".to_string(), 10, 20)
    }

    #[test]
    fn test_record_from_row() {
        let record = record_from_row(row(PLAYER, "203.0.113.5")).unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.updated, 20);
    }

    #[test]
    fn test_record_from_row_skips_invalid() {
        assert!(record_from_row(row("bogus", "203.0.113.5")).is_none());
        assert!(record_from_row(row(PLAYER, "not-an-ip")).is_none());
    }

    #[test]
    fn test_negative_count_clamps() {
        let mut r = row(PLAYER, "203.0.113.5");
        r.2 = -4;
        assert_eq!(record_from_row(r).unwrap().count, 1);
    }

    #[test]
    fn test_fetch_result_advances_past_invalid_rows() {
        let rows = vec![
            (5, PLAYER.to_string(), "10.0.0.1".to_string(), 1, "s".to_string(), 1, 1),
            (6, "bogus".to_string(), "10.0.0.2".to_string(), 1, "s".to_string(), 1, 1),
        ];
        let batch = fetch_result_from_rows(rows, 4);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.checkpoint, 6);
    }

    #[test]
    fn test_empty_fetch_keeps_checkpoint() {
        let batch = fetch_result_from_rows(Vec::new(), 17);
        assert!(batch.is_empty());
        assert_eq!(batch.checkpoint, 17);
    }

    #[test]
    fn test_count_to_sql_saturates() {
        assert_eq!(count_to_sql(3), 3);
        assert_eq!(count_to_sql(u64::MAX), i64::MAX);
    }
}
