use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite error `{0}`")]
    SQLite(#[from] tokio_rusqlite::Error),
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}
