use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::QueueError;

/// Caps how many deliveries a channel may hold unresolved.
#[derive(Clone, Debug)]
pub struct CreditWindow {
    permits: Arc<Semaphore>,
    size: usize,
}

/// One unit of the window, handed back when dropped.
#[derive(Debug)]
pub struct Credit {
    _permit: OwnedSemaphorePermit,
}

impl CreditWindow {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub async fn acquire(&self) -> Result<Credit, QueueError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map(|_permit| Credit { _permit })
            .map_err(|_| QueueError::CreditClosed)
    }

    pub fn try_acquire(&self) -> Option<Credit> {
        self.permits.clone().try_acquire_owned()
            .ok()
            .map(|_permit| Credit { _permit })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// deliveries currently holding a credit
    pub fn outstanding(&self) -> usize {
        self.size - self.permits.available_permits()
    }
}
