// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Networked dialect.
//!
//! Many servers share one MySQL database, so the queue is shared as well:
//! every node's sync loop sees every node's upserts and relays them over
//! pub/sub. Column names are backtick-quoted because `count` and `server`
//! are keywords.
//!
//! `ON DUPLICATE KEY UPDATE` evaluates assignments left to right against
//! the partially updated row, so `updated` is assigned last and every
//! earlier expression still sees the stored value.

use super::{count_to_sql, fetch_result_from_rows, record_from_row, QueueRow, RecordRow};
use crate::config::StorageConfig;
use crate::error::{AltError, Result};
use crate::record::{now_millis, DeleteKey, FetchResult, PlayerData};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

/// Durable store on a MySQL server.
pub struct MysqlStore {
    pool: MySqlPool,
    data_table: String,
    queue_table: String,
    fetch_batch_size: i64,
}

impl MysqlStore {
    /// Connect a pool to `url`. Connectivity failures are store errors.
    pub async fn open(url: &str, config: &StorageConfig) -> Result<Self> {
        info!(pool_size = config.pool_size, "Connecting MySQL store");

        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;

        Ok(Self {
            pool,
            data_table: config.data_table(),
            queue_table: config.queue_table(),
            fetch_batch_size: i64::from(config.fetch_batch_size.max(1)),
        })
    }

    pub async fn initialize_schema(&self) -> Result<()> {
        let data = &self.data_table;
        let queue = &self.queue_table;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS `{data}` (
                `uuid` CHAR(36) NOT NULL,
                `ip` VARCHAR(45) NOT NULL,
                `count` BIGINT NOT NULL,
                `server` VARCHAR(255) NOT NULL,
                `created` BIGINT NOT NULL,
                `updated` BIGINT NOT NULL,
                PRIMARY KEY (`uuid`, `ip`),
                INDEX `idx_ip` (`ip`),
                INDEX `idx_updated` (`updated`)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS `{queue}` (
                `id` BIGINT NOT NULL AUTO_INCREMENT,
                `uuid` CHAR(36) NOT NULL,
                `ip` VARCHAR(45) NOT NULL,
                `count` BIGINT NOT NULL,
                `server` VARCHAR(255) NOT NULL,
                `created` BIGINT NOT NULL,
                `updated` BIGINT NOT NULL,
                `queued` BIGINT NOT NULL,
                PRIMARY KEY (`id`),
                INDEX `idx_queued` (`queued`)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        debug!(data = %data, queue = %queue, "MySQL schema ready");
        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<PlayerData>> {
        let sql = format!(
            "SELECT `uuid`, `ip`, `count`, `server`, `created`, `updated` FROM `{}`",
            self.data_table
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().filter_map(record_from_row).collect())
    }

    pub async fn fetch_dirty(&self, checkpoint: i64) -> Result<FetchResult> {
        let sql = format!(
            "SELECT `id`, `uuid`, `ip`, `count`, `server`, `created`, `updated` FROM `{}` \
             WHERE `id` > ? ORDER BY `id` ASC LIMIT ?",
            self.queue_table
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(checkpoint)
            .bind(self.fetch_batch_size)
            .fetch_all(&self.pool)
            .await?;
        Ok(fetch_result_from_rows(rows, checkpoint))
    }

    pub async fn upsert(&self, record: &PlayerData) -> Result<PlayerData> {
        let data = &self.data_table;
        let uuid = record.uuid.hyphenated().to_string();

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"
            INSERT INTO `{data}` (`uuid`, `ip`, `count`, `server`, `created`, `updated`)
            VALUES (?, ?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                `server` = IF(
                    VALUES(`updated`) > `updated`
                      OR (VALUES(`updated`) = `updated` AND VALUES(`count`) > `count`),
                    VALUES(`server`), `server`),
                `count` = IF(
                    VALUES(`updated`) > `updated`,
                    GREATEST(VALUES(`count`), `count` + 1),
                    GREATEST(VALUES(`count`), `count`)),
                `created` = LEAST(`created`, VALUES(`created`)),
                `updated` = GREATEST(`updated`, VALUES(`updated`))
            "#
        ))
        .bind(&uuid)
        .bind(&record.ip)
        .bind(count_to_sql(record.count))
        .bind(&record.server)
        .bind(record.created)
        .bind(record.updated)
        .execute(&mut *tx)
        .await?;

        let merged: RecordRow = sqlx::query_as(&format!(
            "SELECT `uuid`, `ip`, `count`, `server`, `created`, `updated` FROM `{data}` \
             WHERE `uuid` = ? AND `ip` = ?"
        ))
        .bind(&uuid)
        .bind(&record.ip)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "INSERT INTO `{}` (`uuid`, `ip`, `count`, `server`, `created`, `updated`, `queued`) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.queue_table
        ))
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

        record_from_row(merged)
            .ok_or_else(|| AltError::Internal("merged row failed validation".to_string()))
    }

    pub async fn delete(&self, key: &DeleteKey) -> Result<u64> {
        let (column, value) = match key {
            DeleteKey::Identity(uuid) => ("uuid", uuid.hyphenated().to_string()),
            DeleteKey::Address(ip) => ("ip", ip.clone()),
        };

        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(&format!(
            "DELETE FROM `{}` WHERE `{}` = ?",
            self.data_table, column
        ))
        .bind(&value)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query(&format!(
            "DELETE FROM `{}` WHERE `{}` = ?",
            self.queue_table, column
        ))
        .bind(&value)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(key = %key, removed, "Deleted rows from MySQL store");
        Ok(removed)
    }

    pub async fn latest_checkpoint(&self) -> Result<i64> {
        let sql = format!(
            "SELECT CAST(COALESCE(MAX(`id`), 0) AS SIGNED) FROM `{}`",
            self.queue_table
        );
        let checkpoint: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(checkpoint)
    }

    pub async fn prune_queue(&self, cutoff_millis: i64) -> Result<u64> {
        let sql = format!("DELETE FROM `{}` WHERE `queued` < ?", self.queue_table);
        let result = sqlx::query(&sql)
            .bind(cutoff_millis)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Close the pool. Idempotent.
    pub async fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        self.pool.close().await;
        info!("MySQL store closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
