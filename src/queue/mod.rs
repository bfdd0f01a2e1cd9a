use std::future::Future;

use bytes::Bytes;

pub mod credit;
pub mod error;
pub mod mqtt;

pub use credit::{Credit, CreditWindow};
pub use error::QueueError;

/// Header carrying how many times a delivery was sent back to the queue.
pub const REDELIVERY_HEADER: &str = "x-redelivery-count";

/// A message pushed to a worker, unresolved until handed back to its channel.
#[derive(Debug)]
pub struct Delivery<T> {
    pub payload: Bytes,
    pub redeliveries: u32,
    /// broker specific handle needed to settle the delivery
    pub tag: T,
    pub credit: Credit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Ack,
    /// negative ack, the delivery goes back to the queue
    Requeue,
    /// settled without processing, copied to the dead letter topic
    DeadLetter,
}

/// One worker's exclusive view of the queue.
pub trait QueueChannel: Send {
    type Tag: Send;

    /// Waits for the next push. `None` once the broker cancelled the consumer.
    fn next(
        &mut self,
    ) -> impl Future<Output = Option<Result<Delivery<Self::Tag>, QueueError>>> + Send;

    /// Settles a delivery, releasing its credit.
    fn resolve(
        &mut self,
        delivery: Delivery<Self::Tag>,
        resolution: Resolution,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;
}

/// Opens an independent connection per worker slot.
pub trait Connector: Send + Sync + 'static {
    type Channel: QueueChannel + 'static;

    fn connect(
        &self,
        worker_id: usize,
    ) -> impl Future<Output = Result<Self::Channel, QueueError>> + Send;
}
