use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::{StreamExt, stream::FuturesUnordered};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, error, info, span, warn};

use crate::{
    config::PoolConfig,
    queue::Connector,
    storage::StorageGateway,
    worker::{DeliveryWorker, RedeliveryPolicy, WorkerError},
};

/// How a worker slot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotExit {
    /// cancelled or consumer cancelled by the broker
    Finished,
    /// failed with restarts disabled
    Failed,
    /// failed after `max_restarts` restarts
    GaveUp,
    /// the slot's task panicked
    Panicked,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub restart: bool,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub max_restarts: Option<u32>,
}

impl From<&PoolConfig> for SupervisorOptions {
    fn from(cfg: &PoolConfig) -> Self {
        Self {
            restart: cfg.restart,
            backoff_initial: Duration::from_millis(cfg.backoff_initial_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms.max(cfg.backoff_initial_ms)),
            max_restarts: cfg.max_restarts,
        }
    }
}

/// Exponential, doubling from `initial` up to `max`.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Fixed number of delivery workers, each on its own connection.
pub struct WorkerPool<G, K> {
    gateway: Arc<G>,
    connector: Arc<K>,
    workers: usize,
    policy: RedeliveryPolicy,
    options: SupervisorOptions,
}

impl<G: StorageGateway, K: Connector> WorkerPool<G, K> {
    pub fn new(
        gateway: Arc<G>,
        connector: K,
        workers: usize,
        policy: RedeliveryPolicy,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            gateway,
            connector: Arc::new(connector),
            workers,
            policy,
            options,
        }
    }

    /// Blocks until every slot has ended.
    pub async fn run(self, ct: CancellationToken) -> Vec<SlotExit> {
        info!(workers = self.workers, "starting worker pool");

        let mut slots = FuturesUnordered::new();
        for id in 0..self.workers {
            let worker = DeliveryWorker::new(id, self.gateway.clone(), self.policy);
            let span = span!(Level::INFO, "Worker", id);
            let fut = supervise(worker, self.connector.clone(), self.options.clone(), ct.clone());
            slots.push(tokio::spawn(fut.instrument(span)));
        }

        let mut exits = Vec::with_capacity(self.workers);
        while let Some(res) = slots.next().await {
            let exit = res.unwrap_or_else(|e| {
                error!("worker slot panicked: {e}");
                SlotExit::Panicked
            });
            let remaining = slots.len();
            match exit {
                SlotExit::Finished => info!(remaining, "worker slot finished"),
                _ => warn!(remaining, ?exit, "worker slot lost"),
            }
            exits.push(exit);
        }

        info!("worker pool stopped");
        exits
    }
}

async fn supervise<G: StorageGateway, K: Connector>(
    worker: DeliveryWorker<G>,
    connector: Arc<K>,
    options: SupervisorOptions,
    ct: CancellationToken,
) -> SlotExit {
    let mut backoff = Backoff::new(options.backoff_initial, options.backoff_max);
    let mut restarts = 0;

    loop {
        let started = Instant::now();
        let res = match connector.connect(worker.id()).await {
            Ok(channel) => worker.run(channel, ct.clone()).await,
            Err(e) => Err(WorkerError::from(e)),
        };

        let e = match res {
            Ok(()) => return SlotExit::Finished,
            Err(e) => e,
        };
        error!("worker failed: {e}");

        if ct.is_cancelled() {
            return SlotExit::Finished;
        }
        if !options.restart {
            return SlotExit::Failed;
        }
        if options.max_restarts.is_some_and(|max| restarts >= max) {
            error!(restarts, "giving up on worker slot");
            return SlotExit::GaveUp;
        }

        // a long healthy run starts the backoff over
        if started.elapsed() >= options.backoff_max {
            backoff.reset();
        }
        let delay = backoff.next();
        restarts += 1;
        warn!(restarts, ?delay, "restarting worker");

        tokio::select! {
            _ = ct.cancelled() => return SlotExit::Finished,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
