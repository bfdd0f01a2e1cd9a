use std::time::Duration;

use tokio::time::timeout;

use super::{ReadingRow, StorageError, StorageGateway};
use crate::rollup::RollupRecord;

/// Bounds every write of the inner gateway.
/// An expired write is reported as [`StorageError::Timeout`]; `None` never expires.
///
/// Only the wait is cut short. A write already handed to the SQLite thread
/// still runs later, so a write reported as timed out may land anyway (and
/// add twice in increment mode once the delivery is sent again). The limit
/// also counts time spent queued behind other workers' writes on the shared
/// connection.
pub struct TimeoutGateway<G> {
    inner: G,
    limit: Option<Duration>,
}

impl<G> TimeoutGateway<G> {
    pub fn new(inner: G, limit: Option<Duration>) -> Self {
        Self { inner, limit }
    }
}

impl<G: StorageGateway> StorageGateway for TimeoutGateway<G> {
    async fn write_reading(&self, row: ReadingRow) -> Result<(), StorageError> {
        match self.limit {
            Some(limit) => timeout(limit, self.inner.write_reading(row))
                .await
                .map_err(|_| StorageError::Timeout(limit))?,
            None => self.inner.write_reading(row).await,
        }
    }

    async fn write_rollup(&self, record: RollupRecord) -> Result<(), StorageError> {
        match self.limit {
            Some(limit) => timeout(limit, self.inner.write_rollup(record))
                .await
                .map_err(|_| StorageError::Timeout(limit))?,
            None => self.inner.write_rollup(record).await,
        }
    }
}
