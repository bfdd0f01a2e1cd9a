use std::path::Path;

use rusqlite::params;
use serde::Serialize;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use super::{ReadingRow, RollupWriteMode, StorageError, StorageGateway};
use crate::rollup::{Bucket, RollupRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS readings (
    batch_id     INTEGER NOT NULL,
    sensor       TEXT    NOT NULL,
    timestamp    INTEGER NOT NULL,
    value        REAL    NOT NULL,
    processed_at TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS readings_by_sensor ON readings (sensor, processed_at);
CREATE TABLE IF NOT EXISTS rollup_daily (
    period TEXT NOT NULL,
    sensor TEXT NOT NULL,
    total  REAL NOT NULL,
    PRIMARY KEY (period, sensor)
);
CREATE TABLE IF NOT EXISTS rollup_weekly (
    period TEXT NOT NULL,
    sensor TEXT NOT NULL,
    total  REAL NOT NULL,
    PRIMARY KEY (period, sensor)
);
CREATE TABLE IF NOT EXISTS rollup_monthly (
    period TEXT NOT NULL,
    sensor TEXT NOT NULL,
    total  REAL NOT NULL,
    PRIMARY KEY (period, sensor)
);
";

const INSERT_READING: &str = "INSERT INTO readings (batch_id, sensor, timestamp, value, processed_at)
    VALUES (?1, ?2, ?3, ?4, ?5)";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReading {
    pub sensor: String,
    pub timestamp: i64,
    pub value: f64,
    pub processed_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRollup {
    pub period: String,
    pub total: f64,
}

/// SQLite backed gateway. Cloning shares the same connection.
#[derive(Clone)]
pub struct SqliteGateway {
    conn: Connection,
    mode: RollupWriteMode,
}

impl SqliteGateway {
    pub async fn open(path: impl AsRef<Path>, mode: RollupWriteMode) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!(path = %path.display(), ?mode, "opening storage");
        Self::init(Connection::open(path).await?, mode).await
    }

    pub async fn open_in_memory(mode: RollupWriteMode) -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory().await?, mode).await
    }

    async fn init(conn: Connection, mode: RollupWriteMode) -> Result<Self, StorageError> {
        conn.call(|conn| Ok(conn.execute_batch(SCHEMA)?)).await?;
        Ok(Self { conn, mode })
    }

    /// Newest first. `None` returns every sensor.
    pub async fn recent_readings(
        &self,
        sensor: Option<String>,
        limit: usize,
    ) -> Result<Vec<StoredReading>, StorageError> {
        let limit = limit as i64;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT sensor, timestamp, value, processed_at FROM readings
                     WHERE ?1 IS NULL OR sensor = ?1
                     ORDER BY processed_at DESC, rowid DESC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![sensor, limit], |row| {
                        Ok(StoredReading {
                            sensor: row.get(0)?,
                            timestamp: row.get(1)?,
                            value: row.get(2)?,
                            processed_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Oldest period first.
    pub async fn rollups(
        &self,
        bucket: Bucket,
        sensor: String,
    ) -> Result<Vec<StoredRollup>, StorageError> {
        let sql = format!(
            "SELECT period, total FROM {} WHERE sensor = ?1 ORDER BY period ASC",
            table(bucket)
        );
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map([sensor], |row| {
                        Ok(StoredRollup {
                            period: row.get(0)?,
                            total: row.get(1)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }
}

impl StorageGateway for SqliteGateway {
    async fn write_reading(&self, row: ReadingRow) -> Result<(), StorageError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(INSERT_READING)?;
                stmt.execute(params![
                    row.batch_id,
                    row.sensor,
                    row.timestamp,
                    row.value,
                    row.processed_at
                ])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn write_rollup(&self, record: RollupRecord) -> Result<(), StorageError> {
        let sql = upsert_sql(record.key.bucket, self.mode);
        debug!(
            bucket = ?record.key.bucket,
            period = %record.key.period,
            sensor = %record.key.sensor,
            sum = record.sum,
            "writing rollup"
        );
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                stmt.execute(params![record.key.period, record.key.sensor, record.sum])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn table(bucket: Bucket) -> &'static str {
    match bucket {
        Bucket::Day => "rollup_daily",
        Bucket::Week => "rollup_weekly",
        Bucket::Month => "rollup_monthly",
    }
}

fn upsert_sql(bucket: Bucket, mode: RollupWriteMode) -> String {
    let table = table(bucket);
    let update = match mode {
        RollupWriteMode::Overwrite => "excluded.total".to_string(),
        RollupWriteMode::Increment => format!("{table}.total + excluded.total"),
    };
    format!(
        "INSERT INTO {table} (period, sensor, total) VALUES (?1, ?2, ?3)
         ON CONFLICT (period, sensor) DO UPDATE SET total = {update}"
    )
}
