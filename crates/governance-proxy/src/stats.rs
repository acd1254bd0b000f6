// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline counters.
//!
//! Every event is counted twice: once in an interval counter that the periodic reporter drains
//! and zeroes, and once in a lifetime counter exposed in OpenMetrics text on `/metrics`.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Values of the interval counters at the moment they were drained.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed_metrics: u64,
    pub dropped_metrics: u64,
    pub dropped_tags: u64,
    pub processed_bytes: u64,
    pub failed_dispatches: u64,
}

#[derive(Debug, Default)]
struct IntervalCounters {
    processed_metrics: AtomicU64,
    dropped_metrics: AtomicU64,
    dropped_tags: AtomicU64,
    processed_bytes: AtomicU64,
    failed_dispatches: AtomicU64,
}

struct LifetimeCounters {
    processed_records: Counter,
    processed_bytes: Counter,
    dropped_metrics: Counter,
    dropped_tags: Counter,
    failed_dispatches: Counter,
    rejected_records: Counter,
    tracked_metrics: Gauge,
}

pub struct Stats {
    interval: IntervalCounters,
    lifetime: LifetimeCounters,
    registry: Registry,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        let lifetime = LifetimeCounters {
            processed_records: Counter::default(),
            processed_bytes: Counter::default(),
            dropped_metrics: Counter::default(),
            dropped_tags: Counter::default(),
            failed_dispatches: Counter::default(),
            rejected_records: Counter::default(),
            tracked_metrics: Gauge::default(),
        };

        let mut registry = Registry::with_prefix("governance_proxy");
        registry.register(
            "processed_records",
            "Series records appended to a shard batch",
            lifetime.processed_records.clone(),
        );
        registry.register(
            "processed_bytes",
            "Protobuf-encoded bytes of dispatched batches",
            lifetime.processed_bytes.clone(),
        );
        registry.register(
            "dropped_metrics",
            "Metrics whose cardinality state was evicted",
            lifetime.dropped_metrics.clone(),
        );
        registry.register(
            "dropped_tags",
            "Label windows evicted by cardinality governance",
            lifetime.dropped_tags.clone(),
        );
        registry.register(
            "failed_dispatches",
            "Batches that could not be delivered downstream",
            lifetime.failed_dispatches.clone(),
        );
        registry.register(
            "rejected_records",
            "Series records rejected for lacking a metric name",
            lifetime.rejected_records.clone(),
        );
        registry.register(
            "tracked_metrics",
            "Metrics currently holding cardinality state",
            lifetime.tracked_metrics.clone(),
        );

        Stats {
            interval: IntervalCounters::default(),
            lifetime,
            registry,
        }
    }

    pub fn record_processed(&self, records: u64) {
        self.interval
            .processed_metrics
            .fetch_add(records, Ordering::Relaxed);
        self.lifetime.processed_records.inc_by(records);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.interval
            .processed_bytes
            .fetch_add(bytes, Ordering::Relaxed);
        self.lifetime.processed_bytes.inc_by(bytes);
    }

    pub fn record_dropped_metric(&self) {
        self.interval.dropped_metrics.fetch_add(1, Ordering::Relaxed);
        self.lifetime.dropped_metrics.inc();
    }

    pub fn record_dropped_tags(&self, tags: u64) {
        self.interval.dropped_tags.fetch_add(tags, Ordering::Relaxed);
        self.lifetime.dropped_tags.inc_by(tags);
    }

    pub fn record_failed_dispatch(&self) {
        self.interval
            .failed_dispatches
            .fetch_add(1, Ordering::Relaxed);
        self.lifetime.failed_dispatches.inc();
    }

    pub fn record_rejected(&self) {
        self.lifetime.rejected_records.inc();
    }

    pub fn set_tracked_metrics(&self, metrics: usize) {
        self.lifetime
            .tracked_metrics
            .set(i64::try_from(metrics).unwrap_or(i64::MAX));
    }

    /// Reads and zeroes every interval counter.
    ///
    /// Each counter is swapped atomically, so an increment racing with the drain is reported
    /// either in this snapshot or in the next one, never in both and never lost.
    pub fn drain(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed_metrics: self.interval.processed_metrics.swap(0, Ordering::AcqRel),
            dropped_metrics: self.interval.dropped_metrics.swap(0, Ordering::AcqRel),
            dropped_tags: self.interval.dropped_tags.swap(0, Ordering::AcqRel),
            processed_bytes: self.interval.processed_bytes.swap(0, Ordering::AcqRel),
            failed_dispatches: self.interval.failed_dispatches.swap(0, Ordering::AcqRel),
        }
    }

    /// Current interval counters, without resetting them.
    pub fn peek(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed_metrics: self.interval.processed_metrics.load(Ordering::Acquire),
            dropped_metrics: self.interval.dropped_metrics.load(Ordering::Acquire),
            dropped_tags: self.interval.dropped_tags.load(Ordering::Acquire),
            processed_bytes: self.interval.processed_bytes.load(Ordering::Acquire),
            failed_dispatches: self.interval.failed_dispatches.load(Ordering::Acquire),
        }
    }

    /// Renders the lifetime counters in OpenMetrics text format.
    pub fn encode_openmetrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// Logs a JSON line with the drained interval counters every `period` until cancelled.
pub async fn report_periodically(
    stats: Arc<Stats>,
    period: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Stats reporter stopped");
                return;
            }
            _ = ticker.tick() => {
                let snapshot = stats.drain();
                match serde_json::to_string(&snapshot) {
                    Ok(line) => info!("{line}"),
                    Err(e) => error!("Could not encode stats: {e}"),
                }
            }
        }
    }
}
