use std::sync::Arc;

use jiff::Zoned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    codec::{self, Batch},
    queue::{QueueChannel, QueueError, Resolution},
    rollup,
    storage::{ReadingRow, StorageGateway},
};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("queue error `{0}`")]
    Queue(#[from] QueueError),
}

/// What to do with a delivery whose envelope cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// `None` requeues forever
    pub max_redeliveries: Option<u32>,
}

impl RedeliveryPolicy {
    pub fn on_malformed(&self, redeliveries: u32) -> Resolution {
        match self.max_redeliveries {
            Some(max) if redeliveries >= max => Resolution::DeadLetter,
            _ => Resolution::Requeue,
        }
    }
}

/// What happened to the batches of one delivery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// inner batches in the envelope
    pub batches: usize,
    /// batches decoded and written (maybe with failed writes)
    pub processed: usize,
    /// indexes of batches that failed to decode
    pub skipped: Vec<usize>,
    pub failed_writes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub resolution: Resolution,
    pub report: DeliveryReport,
}

/// Consumes one channel, one delivery at a time.
pub struct DeliveryWorker<G> {
    id: usize,
    gateway: Arc<G>,
    policy: RedeliveryPolicy,
}

impl<G> Clone for DeliveryWorker<G> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            gateway: self.gateway.clone(),
            policy: self.policy,
        }
    }
}

impl<G: StorageGateway> DeliveryWorker<G> {
    pub fn new(id: usize, gateway: Arc<G>, policy: RedeliveryPolicy) -> Self {
        Self {
            id,
            gateway,
            policy,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Runs until cancelled, the broker cancels the consumer (both `Ok`),
    /// or the connection is lost (`Err`).
    /// A delivery already received is always resolved before returning.
    pub async fn run<C: QueueChannel>(
        &self,
        mut channel: C,
        ct: CancellationToken,
    ) -> Result<(), WorkerError> {
        info!("consuming");
        loop {
            let next = tokio::select! {
                biased;
                _ = ct.cancelled() => {
                    info!("shutting down");
                    return Ok(());
                }
                next = channel.next() => next,
            };

            let delivery = match next {
                Some(delivery) => delivery?,
                None => {
                    info!("consumer cancelled by broker");
                    return Ok(());
                }
            };

            let outcome = self
                .handle(&delivery.payload, delivery.redeliveries, Zoned::now())
                .await;
            debug!(resolution = ?outcome.resolution, report = ?outcome.report, "resolving");
            channel.resolve(delivery, outcome.resolution).await?;
        }
    }

    /// Decodes and stores one delivery.
    ///
    /// Only a malformed envelope rejects the delivery. A bad inner batch or a
    /// failed write is logged and skipped, the rest of the delivery still lands
    /// and it is acknowledged.
    pub async fn handle(&self, payload: &[u8], redeliveries: u32, now: Zoned) -> Outcome {
        let messages = match codec::decode_envelope(payload) {
            Ok(messages) => messages,
            Err(e) => {
                let resolution = self.policy.on_malformed(redeliveries);
                error!(redeliveries, ?resolution, "{e}");
                return Outcome {
                    resolution,
                    report: DeliveryReport::default(),
                };
            }
        };

        let mut report = DeliveryReport {
            batches: messages.len(),
            ..Default::default()
        };

        for (idx, bytes) in messages.iter().enumerate() {
            let batch = match codec::decode_batch(bytes) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(batch = idx, "skipping batch: {e}");
                    report.skipped.push(idx);
                    continue;
                }
            };

            report.failed_writes += self.store(&batch, &now).await;
            report.processed += 1;
        }

        if report.failed_writes > 0 {
            warn!(
                failed = report.failed_writes,
                "delivery acknowledged with failed writes"
            );
        }

        Outcome {
            resolution: Resolution::Ack,
            report,
        }
    }

    /// One write per reading then one per bucket. Returns how many failed.
    async fn store(&self, batch: &Batch, now: &Zoned) -> usize {
        let processed_at = now.strftime("%Y-%m-%d %H:%M:%S%.3f").to_string();
        let mut failed = 0;

        for reading in &batch.readings {
            let row = ReadingRow {
                batch_id: batch.batch_id,
                sensor: batch.sensor.clone(),
                timestamp: reading.t,
                value: reading.v,
                processed_at: processed_at.clone(),
            };
            if let Err(e) = self.gateway.write_reading(row).await {
                error!(
                    batch_id = batch.batch_id,
                    sensor = %batch.sensor,
                    timestamp = reading.t,
                    "writing reading: {e}"
                );
                failed += 1;
            }
        }

        let rollup = rollup::aggregate(batch, now);
        for record in rollup.records() {
            let bucket = record.key.bucket;
            if let Err(e) = self.gateway.write_rollup(record).await {
                error!(?bucket, sensor = %batch.sensor, "writing rollup: {e}");
                failed += 1;
            }
        }

        debug!(
            batch_id = batch.batch_id,
            sensor = %batch.sensor,
            readings = batch.readings.len(),
            sum = rollup.sum,
            "stored batch"
        );
        failed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use bytes::Bytes;
    use tracing_subscriber::{
        Layer,
        layer::{Context, SubscriberExt},
    };

    use super::*;
    use crate::{
        codec::{Reading, encode_batch, encode_envelope},
        queue::{CreditWindow, Delivery},
        rollup::{Bucket, RollupRecord},
        storage::StorageError,
    };

    /// Records every write, optionally failing all of them.
    #[derive(Default)]
    pub(crate) struct FakeGateway {
        pub fail: bool,
        pub readings: Mutex<Vec<ReadingRow>>,
        pub rollups: Mutex<Vec<RollupRecord>>,
        pub attempts: AtomicUsize,
    }

    impl FakeGateway {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn attempt(&self) -> Result<(), StorageError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.fail {
                true => Err(StorageError::SQLite(tokio_rusqlite::Error::ConnectionClosed)),
                false => Ok(()),
            }
        }
    }

    impl StorageGateway for FakeGateway {
        async fn write_reading(&self, row: ReadingRow) -> Result<(), StorageError> {
            self.attempt()?;
            self.readings.lock().unwrap().push(row);
            Ok(())
        }

        async fn write_rollup(&self, record: RollupRecord) -> Result<(), StorageError> {
            self.attempt()?;
            self.rollups.lock().unwrap().push(record);
            Ok(())
        }
    }

    /// In memory channel, every queued delivery takes a credit up front so a
    /// test can check that resolving hands every credit back.
    pub(crate) struct FakeChannel {
        pub window: CreditWindow,
        pub pending: VecDeque<Result<Delivery<usize>, QueueError>>,
        pub resolved: Arc<Mutex<Vec<(usize, Resolution)>>>,
    }

    impl FakeChannel {
        pub fn new(window: usize, payloads: Vec<Vec<u8>>) -> Self {
            let mut channel = Self {
                window: CreditWindow::new(window),
                pending: VecDeque::new(),
                resolved: Default::default(),
            };
            for payload in payloads {
                channel.push(payload, 0);
            }
            channel
        }

        pub fn push(&mut self, payload: Vec<u8>, redeliveries: u32) {
            let credit = self
                .window
                .try_acquire()
                .expect("test queued more deliveries than the window allows");
            let tag = self.pending.len();
            self.pending.push_back(Ok(Delivery {
                payload: Bytes::from(payload),
                redeliveries,
                tag,
                credit,
            }));
        }
    }

    impl QueueChannel for FakeChannel {
        type Tag = usize;

        async fn next(&mut self) -> Option<Result<Delivery<usize>, QueueError>> {
            self.pending.pop_front()
        }

        async fn resolve(
            &mut self,
            delivery: Delivery<usize>,
            resolution: Resolution,
        ) -> Result<(), QueueError> {
            self.resolved.lock().unwrap().push((delivery.tag, resolution));
            Ok(())
        }
    }

    pub(crate) fn batch(batch_id: i64, sensor: &str, values: &[f64]) -> Batch {
        Batch {
            batch_id,
            sensor: sensor.to_string(),
            readings: values
                .iter()
                .enumerate()
                .map(|(i, v)| Reading { t: i as i64, v: *v })
                .collect(),
        }
    }

    fn now() -> Zoned {
        jiff::civil::date(2024, 3, 15)
            .at(10, 30, 0, 0)
            .to_zoned(jiff::tz::TimeZone::UTC)
            .unwrap()
    }

    fn worker(gateway: FakeGateway) -> (DeliveryWorker<FakeGateway>, Arc<FakeGateway>) {
        let gateway = Arc::new(gateway);
        (
            DeliveryWorker::new(0, gateway.clone(), RedeliveryPolicy::default()),
            gateway,
        )
    }

    /// field 1 varint with no value
    const BROKEN_BATCH: &[u8] = &[0x08];
    /// field 1, length 5, only 2 bytes follow
    const BROKEN_ENVELOPE: &[u8] = &[0x0a, 0x05, b'a', b'b'];

    #[tokio::test]
    async fn test_write_counts_per_batch() {
        let (worker, gw) = worker(FakeGateway::default());
        let payload = encode_envelope(&[batch(1, "s1", &[1.0, 2.0, 3.0, 4.0, 5.0])]);

        let outcome = worker.handle(&payload, 0, now()).await;
        assert_eq!(outcome.resolution, Resolution::Ack);
        assert_eq!(gw.readings.lock().unwrap().len(), 5);

        let rollups = gw.rollups.lock().unwrap();
        assert_eq!(rollups.len(), 3);
        let buckets: Vec<Bucket> = rollups.iter().map(|r| r.key.bucket).collect();
        assert_eq!(buckets, Bucket::ALL);
        assert!(rollups.iter().all(|r| r.sum == 15.0 && r.key.sensor == "s1"));
    }

    #[tokio::test]
    async fn test_reading_rows_carry_batch_fields() {
        let (worker, gw) = worker(FakeGateway::default());
        let payload = encode_envelope(&[batch(77, "s9", &[2.5])]);
        worker.handle(&payload, 0, now()).await;

        let readings = gw.readings.lock().unwrap();
        assert_eq!(
            readings[0],
            ReadingRow {
                batch_id: 77,
                sensor: "s9".to_string(),
                timestamp: 0,
                value: 2.5,
                processed_at: "2024-03-15 10:30:00.000".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_empty_batch_still_rolls_up() {
        let (worker, gw) = worker(FakeGateway::default());
        let payload = encode_envelope(&[batch(1, "s1", &[])]);

        let outcome = worker.handle(&payload, 0, now()).await;
        assert_eq!(outcome.resolution, Resolution::Ack);
        assert!(gw.readings.lock().unwrap().is_empty());
        let rollups = gw.rollups.lock().unwrap();
        assert_eq!(rollups.len(), 3);
        assert!(rollups.iter().all(|r| r.sum == 0.0));
    }

    #[tokio::test]
    async fn test_malformed_batch_is_isolated() {
        let (worker, gw) = worker(FakeGateway::default());
        let envelope = codec::Envelope {
            messages: vec![
                encode_batch(&batch(1, "a", &[1.0])),
                BROKEN_BATCH.to_vec(),
                encode_batch(&batch(3, "c", &[2.0, 3.0])),
            ],
        };
        let payload = prost::Message::encode_to_vec(&envelope);

        let outcome = worker.handle(&payload, 0, now()).await;
        assert_eq!(outcome.resolution, Resolution::Ack);
        assert_eq!(
            outcome.report,
            DeliveryReport {
                batches: 3,
                processed: 2,
                skipped: vec![1],
                failed_writes: 0,
            }
        );
        assert_eq!(gw.readings.lock().unwrap().len(), 3);
        assert_eq!(gw.rollups.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_requeued_without_writes() {
        let (worker, gw) = worker(FakeGateway::default());

        let outcome = worker.handle(BROKEN_ENVELOPE, 0, now()).await;
        assert_eq!(outcome.resolution, Resolution::Requeue);
        assert_eq!(outcome.report, DeliveryReport::default());
        assert_eq!(gw.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_storage_failures_still_ack() {
        let (worker, gw) = worker(FakeGateway::failing());
        let payload = encode_envelope(&[batch(1, "a", &[1.0, 2.0]), batch(2, "b", &[3.0])]);

        let outcome = worker.handle(&payload, 0, now()).await;
        assert_eq!(outcome.resolution, Resolution::Ack);
        // 3 readings + 2 * 3 rollups, each failure counted once
        assert_eq!(outcome.report.failed_writes, 9);
        assert_eq!(gw.attempts.load(Ordering::SeqCst), 9);
        assert_eq!(outcome.report.processed, 2);
    }

    /// Records the level of every event it sees.
    struct LevelRecorder(Arc<Mutex<Vec<tracing::Level>>>);

    impl<S: tracing::Subscriber> Layer<S> for LevelRecorder {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            self.0.lock().unwrap().push(*event.metadata().level());
        }
    }

    #[tokio::test]
    async fn test_one_error_record_per_failed_write() {
        let levels = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(LevelRecorder(levels.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let (worker, _gw) = worker(FakeGateway::failing());
        let payload = encode_envelope(&[batch(1, "a", &[1.0, 2.0])]);
        let outcome = worker.handle(&payload, 0, now()).await;

        let levels = levels.lock().unwrap();
        let errors = levels
            .iter()
            .filter(|l| **l == tracing::Level::ERROR)
            .count();
        // 2 readings + 3 rollups
        assert_eq!(outcome.report.failed_writes, 5);
        assert_eq!(errors, 5);
        assert_eq!(
            levels
                .iter()
                .filter(|l| **l == tracing::Level::WARN)
                .count(),
            1
        );
    }

    #[test]
    fn test_redelivery_policy() {
        let unbounded = RedeliveryPolicy::default();
        assert_eq!(unbounded.on_malformed(1_000_000), Resolution::Requeue);

        let bounded = RedeliveryPolicy {
            max_redeliveries: Some(3),
        };
        assert_eq!(bounded.on_malformed(2), Resolution::Requeue);
        assert_eq!(bounded.on_malformed(3), Resolution::DeadLetter);
    }

    #[tokio::test]
    async fn test_run_resolves_each_delivery_once_in_order() {
        let (worker, gw) = worker(FakeGateway::failing());
        let mut channel = FakeChannel::new(
            4,
            vec![
                encode_envelope(&[batch(1, "a", &[1.0])]),
                BROKEN_ENVELOPE.to_vec(),
                encode_envelope(&[batch(2, "b", &[2.0])]),
            ],
        );
        channel.push(BROKEN_ENVELOPE.to_vec(), 9);
        let resolved = channel.resolved.clone();
        let window = channel.window.clone();

        let worker = DeliveryWorker::new(
            1,
            worker.gateway.clone(),
            RedeliveryPolicy {
                max_redeliveries: Some(5),
            },
        );
        worker.run(channel, CancellationToken::new()).await.unwrap();

        assert_eq!(
            *resolved.lock().unwrap(),
            vec![
                (0, Resolution::Ack),
                (1, Resolution::Requeue),
                (2, Resolution::Ack),
                (3, Resolution::DeadLetter),
            ]
        );
        assert_eq!(window.outstanding(), 0);
        assert_eq!(gw.attempts.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (worker, _gw) = worker(FakeGateway::default());
        let channel = FakeChannel::new(1, vec![encode_envelope(&[batch(1, "a", &[1.0])])]);
        let resolved = channel.resolved.clone();

        let ct = CancellationToken::new();
        ct.cancel();
        worker.run(channel, ct).await.unwrap();
        assert!(resolved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_surfaces_connection_fault() {
        let (worker, _gw) = worker(FakeGateway::default());
        let mut channel = FakeChannel::new(2, vec![]);
        channel
            .pending
            .push_back(Err(QueueError::Closed("reset by peer".to_string())));

        let err = worker.run(channel, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Queue(QueueError::Closed(_))));
    }
}
