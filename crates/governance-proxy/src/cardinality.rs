// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cardinality governance.
//!
//! For every (metric, label name) pair the tracker keeps a bounded FIFO of the most recently
//! first-seen label values and a counter of how many values were new relative to that window.
//! The counter is a windowed approximation of distinct values: it never decreases, and a value
//! that fell out of the window counts again when it comes back.
//!
//! When governance is enabled, every new observation is followed by an enforcement step that may
//! forget a whole metric, forget one label, or evict the least recently observed label name.

use crate::config::{EvictionMode, GovernanceConfig};
use crate::series::{TimeSeries, METRIC_NAME_LABEL};
use crate::stats::Stats;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

/// Outcome of observing one label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// The value was not in the window and has been appended to it.
    pub new: bool,
    /// Cardinality counter of the pair after the observation.
    pub cardinality: u64,
}

/// What an enforcement step did to the tracked state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enforcement {
    Kept,
    MetricDropped,
    TagDropped,
    TagsEvicted(Vec<String>),
}

/// What the ingress should do with a record after governance ran over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Forward the record. Labels listed here were dropped by governance and have already been
    /// removed from it.
    Retain { stripped: Vec<String> },
    /// The record pushed its metric over the limit and the metric was dropped.
    Drop,
    /// The record has no `__name__` label.
    MissingName,
}

#[derive(Debug)]
struct TagWindow {
    values: VecDeque<String>,
    cardinality: u64,
    last_observed: u64,
}

impl TagWindow {
    fn new(capacity: usize) -> Self {
        TagWindow {
            values: VecDeque::with_capacity(capacity.min(1024)),
            cardinality: 0,
            last_observed: 0,
        }
    }

    fn observe(&mut self, value: &str, capacity: usize, sequence: u64) -> Observation {
        self.last_observed = sequence;
        if self.values.iter().any(|v| v == value) {
            return Observation {
                new: false,
                cardinality: self.cardinality,
            };
        }

        self.cardinality += 1;
        self.values.push_back(value.to_owned());
        while self.values.len() > capacity {
            self.values.pop_front();
        }
        Observation {
            new: true,
            cardinality: self.cardinality,
        }
    }
}

#[derive(Debug, Default)]
struct MetricState {
    labels: HashMap<String, TagWindow>,
    // Bumped on every observation; orders label names by recency for eviction.
    sequence: u64,
}

impl MetricState {
    fn exceeds(&self, label_name: &str, limit: u64) -> bool {
        self.labels
            .get(label_name)
            .is_some_and(|window| window.cardinality > limit)
    }

    fn least_recently_observed(&self) -> Option<String> {
        self.labels
            .iter()
            .min_by(|(a_name, a), (b_name, b)| {
                a.last_observed
                    .cmp(&b.last_observed)
                    .then_with(|| a_name.cmp(b_name))
            })
            .map(|(name, _)| name.clone())
    }
}

pub struct CardinalityTracker {
    config: GovernanceConfig,
    metrics: DashMap<String, MetricState>,
    stats: Arc<Stats>,
}

impl CardinalityTracker {
    #[must_use]
    pub fn new(config: GovernanceConfig, stats: Arc<Stats>) -> Self {
        CardinalityTracker {
            config,
            metrics: DashMap::new(),
            stats,
        }
    }

    #[must_use]
    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    /// Records `label_value` in the window of (`metric_name`, `label_name`), creating the metric
    /// and the window on first use.
    pub fn observe(&self, metric_name: &str, label_name: &str, label_value: &str) -> Observation {
        let capacity = self.config.capacity;
        let observe_in = |state: &mut MetricState| {
            state.sequence += 1;
            let sequence = state.sequence;
            match state.labels.get_mut(label_name) {
                Some(window) => window.observe(label_value, capacity, sequence),
                None => state
                    .labels
                    .entry(label_name.to_owned())
                    .or_insert_with(|| TagWindow::new(capacity))
                    .observe(label_value, capacity, sequence),
            }
        };

        if let Some(mut state) = self.metrics.get_mut(metric_name) {
            return observe_in(state.value_mut());
        }
        let mut state = self.metrics.entry(metric_name.to_owned()).or_default();
        observe_in(state.value_mut())
    }

    /// Applies the eviction mode to (`metric_name`, `label_name`) using the current counter.
    /// Callers run it after an observation reported a new value.
    pub fn enforce(&self, metric_name: &str, label_name: &str) -> Enforcement {
        if !self.config.enabled {
            return Enforcement::Kept;
        }
        let limit = self.config.limit;

        match self.config.mode {
            EvictionMode::DropMetric => {
                let removed = self
                    .metrics
                    .remove_if(metric_name, |_, state| state.exceeds(label_name, limit));
                if removed.is_none() {
                    return Enforcement::Kept;
                }
                warn!(
                    "Dropping metric due to cardinality limit for metric: {metric_name} and tag: {label_name}"
                );
                self.stats.record_dropped_metric();
                Enforcement::MetricDropped
            }
            EvictionMode::DropTag => {
                let dropped = match self.metrics.get_mut(metric_name) {
                    Some(mut state) if state.exceeds(label_name, limit) => {
                        state.labels.remove(label_name);
                        true
                    }
                    _ => false,
                };
                if !dropped {
                    return Enforcement::Kept;
                }
                warn!(
                    "Dropping tag due to cardinality limit for metric: {metric_name} and tag: {label_name}"
                );
                self.stats.record_dropped_tags(1);
                Enforcement::TagDropped
            }
            EvictionMode::KeepRecentTags => {
                let mut evicted = Vec::new();
                if let Some(mut state) = self.metrics.get_mut(metric_name) {
                    while state.labels.len() > self.config.max_tags {
                        let Some(victim) = state.least_recently_observed() else {
                            break;
                        };
                        state.labels.remove(&victim);
                        evicted.push(victim);
                    }
                }
                if evicted.is_empty() {
                    return Enforcement::Kept;
                }
                warn!(
                    "Evicted least recently observed tags {evicted:?} of metric {metric_name}"
                );
                self.stats.record_dropped_tags(evicted.len() as u64);
                Enforcement::TagsEvicted(evicted)
            }
        }
    }

    /// Runs observation and, for new values, enforcement over every label of `series`.
    ///
    /// Labels whose window was dropped by `drop_tag` are removed from the record. A `drop_metric`
    /// eviction stops processing and the record must not be forwarded.
    pub fn govern(&self, series: &mut TimeSeries) -> Verdict {
        let Some(metric_name) = series.metric_name().map(str::to_owned) else {
            return Verdict::MissingName;
        };

        let mut stripped = Vec::new();
        for label in series.tag_labels() {
            let observation = self.observe(&metric_name, &label.name, &label.value);
            if !observation.new || !self.config.enabled {
                continue;
            }
            match self.enforce(&metric_name, &label.name) {
                Enforcement::MetricDropped => return Verdict::Drop,
                Enforcement::TagDropped => stripped.push(label.name.clone()),
                Enforcement::Kept | Enforcement::TagsEvicted(_) => {}
            }
        }

        if !stripped.is_empty() {
            series
                .labels
                .retain(|label| label.name == METRIC_NAME_LABEL || !stripped.contains(&label.name));
        }
        Verdict::Retain { stripped }
    }

    /// Metric name to label name to cardinality, keeping pairs at or above `min_cardinality`.
    /// Metrics left without any qualifying label are omitted.
    pub fn snapshot(&self, min_cardinality: u64) -> BTreeMap<String, BTreeMap<String, u64>> {
        let mut result = BTreeMap::new();
        for entry in &self.metrics {
            let labels: BTreeMap<String, u64> = entry
                .value()
                .labels
                .iter()
                .filter(|(_, window)| window.cardinality >= min_cardinality)
                .map(|(name, window)| (name.clone(), window.cardinality))
                .collect();
            if !labels.is_empty() {
                result.insert(entry.key().clone(), labels);
            }
        }
        result
    }

    #[must_use]
    pub fn tracked_metrics(&self) -> usize {
        self.metrics.len()
    }

    /// Number of values currently held in the window of a pair.
    #[must_use]
    pub fn window_len(&self, metric_name: &str, label_name: &str) -> Option<usize> {
        self.metrics
            .get(metric_name)
            .and_then(|state| state.labels.get(label_name).map(|w| w.values.len()))
    }

    /// Values currently held in the window of a pair, oldest first.
    #[must_use]
    pub fn window_values(&self, metric_name: &str, label_name: &str) -> Option<Vec<String>> {
        self.metrics.get(metric_name).and_then(|state| {
            state
                .labels
                .get(label_name)
                .map(|w| w.values.iter().cloned().collect())
        })
    }
}
