use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::rollup::RollupRecord;

pub mod error;
pub mod sqlite;
pub mod timeout;

pub use error::StorageError;
pub use sqlite::SqliteGateway;
pub use timeout::TimeoutGateway;

/// One raw reading as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingRow {
    pub batch_id: i64,
    pub sensor: String,
    pub timestamp: i64,
    pub value: f64,
    /// `YYYY-MM-DD HH:MM:SS.mmm`, local time
    pub processed_at: String,
}

/// How a rollup write lands on an already stored bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RollupWriteMode {
    /// last write wins, the bucket holds the sum of the most recent batch
    #[default]
    Overwrite,
    /// the batch sum is added to the stored total
    Increment,
}

/// Write surface the delivery workers depend on.
///
/// Shared by every worker at once, so implementations must be safe for
/// concurrent use. Each call is a single logical write and may be retried
/// independently.
pub trait StorageGateway: Send + Sync + 'static {
    fn write_reading(
        &self,
        row: ReadingRow,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn write_rollup(
        &self,
        record: RollupRecord,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}
