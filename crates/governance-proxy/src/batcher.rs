// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sharded batching.
//!
//! Accepted series go through a bounded queue to a pool of workers. A worker hashes the metric
//! name to a shard id and appends the series to that shard's batch; the shard id also selects the
//! downstream endpoint. Batches are shared by all workers, so a metric always lands in one batch
//! no matter which worker picked it up.
//!
//! A batch is dispatched as soon as it reaches `batch_size`, or `release_after` after the first
//! series joined an empty batch, whichever comes first. Dispatch runs while the shard is locked,
//! so batches of one shard reach the dispatcher in order.

use dashmap::DashMap;
use fnv::FnvBuildHasher;
use serde_json::json;
use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::dispatcher::Dispatcher;
use crate::errors::SubmitError;
use crate::hash::{select_endpoint, shard_of};
use crate::series::{encoded_len, TimeSeries, METRIC_NAME_LABEL};
use crate::stats::Stats;

/// A governed series on its way to a shard batch.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub series: TimeSeries,
    pub endpoints: Arc<[String]>,
    pub debug: bool,
}

/// Producer side of the work queue. Submitting waits while the queue is full.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<WorkItem>,
}

impl WorkQueue {
    pub async fn submit(&self, item: WorkItem) -> Result<(), SubmitError> {
        self.tx.send(item).await.map_err(|_| SubmitError::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub release_after: Duration,
    pub queue_capacity: usize,
}

impl From<&ProxyConfig> for BatcherConfig {
    fn from(config: &ProxyConfig) -> Self {
        BatcherConfig {
            workers: config.workers,
            batch_size: config.batch_size,
            release_after: config.release_after(),
            queue_capacity: config.queue_capacity,
        }
    }
}

#[derive(Debug)]
struct Destination {
    endpoint: String,
    debug: bool,
}

#[derive(Debug)]
struct PendingFlush {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct ShardBatch {
    records: Vec<TimeSeries>,
    destination: Option<Destination>,
    pending: Option<PendingFlush>,
    // Identifies the deferred flush armed last; a timer whose generation is stale does nothing.
    generation: u64,
}

pub struct BatchRouter {
    shards: DashMap<u32, Arc<Mutex<ShardBatch>>, FnvBuildHasher>,
    dispatcher: Arc<dyn Dispatcher>,
    stats: Arc<Stats>,
    batch_size: usize,
    release_after: Duration,
}

impl BatchRouter {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        stats: Arc<Stats>,
        batch_size: usize,
        release_after: Duration,
    ) -> Self {
        BatchRouter {
            shards: DashMap::with_hasher(FnvBuildHasher::default()),
            dispatcher,
            stats,
            batch_size: batch_size.max(1),
            release_after,
        }
    }

    fn shard(&self, shard_id: u32) -> Arc<Mutex<ShardBatch>> {
        if let Some(shard) = self.shards.get(&shard_id) {
            return Arc::clone(shard.value());
        }
        Arc::clone(self.shards.entry(shard_id).or_default().value())
    }

    /// Appends the series of `item` to its shard batch, dispatching or scheduling the batch.
    pub async fn route(self: &Arc<Self>, item: WorkItem) {
        let WorkItem {
            series,
            endpoints,
            debug,
        } = item;

        let shard_id = match series.metric_name() {
            Some(name) => shard_of(name),
            None => {
                warn!("Discarding series without a metric name");
                self.stats.record_rejected();
                return;
            }
        };
        let Some(endpoint) = select_endpoint(shard_id, &endpoints).map(str::to_owned) else {
            warn!("Discarding series: no remote write endpoint configured");
            self.stats.record_rejected();
            return;
        };

        let shard = self.shard(shard_id);
        let mut batch = shard.lock().await;
        batch.destination = Some(Destination { endpoint, debug });
        batch.records.push(series);
        self.stats.record_processed(1);

        if batch.records.len() >= self.batch_size {
            if let Some(pending) = batch.pending.take() {
                pending.cancel.cancel();
            }
            let records = mem::take(&mut batch.records);
            if let Some(destination) = batch.destination.as_ref() {
                self.flush(shard_id, destination, &records).await;
            }
        } else if batch.pending.is_none() {
            batch.generation += 1;
            let generation = batch.generation;
            let cancel = CancellationToken::new();
            batch.pending = Some(PendingFlush {
                generation,
                cancel: cancel.clone(),
            });

            let router = Arc::clone(self);
            let shard = Arc::clone(&shard);
            tokio::spawn(async move {
                router
                    .release_after_timeout(shard_id, shard, generation, cancel)
                    .await;
            });
        }
    }

    async fn release_after_timeout(
        &self,
        shard_id: u32,
        shard: Arc<Mutex<ShardBatch>>,
        generation: u64,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(self.release_after) => {}
        }

        let mut batch = shard.lock().await;
        match &batch.pending {
            Some(pending) if pending.generation == generation => {}
            _ => return,
        }
        batch.pending = None;
        if batch.records.is_empty() {
            return;
        }

        debug!("Releasing shard {shard_id} after timeout");
        let records = mem::take(&mut batch.records);
        if let Some(destination) = batch.destination.as_ref() {
            self.flush(shard_id, destination, &records).await;
        }
    }

    /// Dispatches every non-empty batch and disarms pending timers.
    pub async fn flush_all(&self) {
        let shards: Vec<(u32, Arc<Mutex<ShardBatch>>)> = self
            .shards
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        for (shard_id, shard) in shards {
            let mut batch = shard.lock().await;
            if let Some(pending) = batch.pending.take() {
                pending.cancel.cancel();
            }
            if batch.records.is_empty() {
                continue;
            }
            let records = mem::take(&mut batch.records);
            if let Some(destination) = batch.destination.as_ref() {
                self.flush(shard_id, destination, &records).await;
            }
        }
    }

    async fn flush(&self, shard_id: u32, destination: &Destination, records: &[TimeSeries]) {
        self.stats.record_bytes(encoded_len(records) as u64);
        if destination.debug {
            info!(
                "Flushing {} series of shard {shard_id} to {}",
                records.len(),
                destination.endpoint
            );
            log_series(records);
        } else {
            debug!(
                "Flushing {} series of shard {shard_id} to {}",
                records.len(),
                destination.endpoint
            );
        }
        if let Err(e) = self
            .dispatcher
            .dispatch(&destination.endpoint, records, destination.debug)
            .await
        {
            error!(
                "Failed to send {} series to {}: {e}",
                records.len(),
                destination.endpoint
            );
            self.stats.record_failed_dispatch();
        }
    }
}

fn log_series(records: &[TimeSeries]) {
    for series in records {
        let name = series.metric_name().unwrap_or_default();
        let labels: BTreeMap<&str, &str> = series
            .labels
            .iter()
            .filter(|label| label.name != METRIC_NAME_LABEL)
            .map(|label| (label.name.as_str(), label.value.as_str()))
            .collect();
        for sample in &series.samples {
            info!(
                "{}",
                json!({
                    "name": name,
                    "labels": labels,
                    "value": sample.value,
                    "timestamp": sample.timestamp,
                })
            );
        }
    }
}

/// Workers draining the work queue into a shared [`BatchRouter`].
pub struct WorkerPool {
    router: Arc<BatchRouter>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    #[must_use]
    pub fn start(
        config: &BatcherConfig,
        dispatcher: Arc<dyn Dispatcher>,
        stats: Arc<Stats>,
    ) -> (WorkQueue, WorkerPool) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let router = Arc::new(BatchRouter::new(
            dispatcher,
            stats,
            config.batch_size,
            config.release_after,
        ));

        let workers = (0..config.workers.max(1))
            .map(|id| {
                tokio::spawn(run_worker(id, Arc::clone(&rx), Arc::clone(&router)))
            })
            .collect();
        info!(
            "Started {} workers, batch size {}, release after {:?}",
            config.workers.max(1),
            config.batch_size,
            config.release_after
        );

        (WorkQueue { tx }, WorkerPool { router, workers })
    }

    #[must_use]
    pub fn router(&self) -> &Arc<BatchRouter> {
        &self.router
    }

    /// Waits for the workers to drain the queue, which ends once every [`WorkQueue`] clone has
    /// been dropped, then dispatches whatever is still batched.
    pub async fn shutdown(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {e}");
            }
        }
        self.router.flush_all().await;
        info!("Worker pool stopped");
    }
}

async fn run_worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    router: Arc<BatchRouter>,
) {
    loop {
        let item = rx.lock().await.recv().await;
        match item {
            Some(item) => router.route(item).await,
            None => {
                debug!("Worker {id} stopped: work queue closed");
                return;
            }
        }
    }
}
