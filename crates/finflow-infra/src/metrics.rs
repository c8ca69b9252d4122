//! Metrics sinks
//!
//! Emission is fire-and-forget: no sink blocks on I/O or reports failure
//! back to the pipeline.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use finflow_core::{MetricEvent, MetricsSink};

/// Series identity: metric name plus sorted labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl SeriesKey {
    fn render(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let labels = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}{{{}}}", self.name, labels)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SeriesValue {
    pub sum: f64,
    pub count: u64,
}

/// Aggregates observations per series in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetrics {
    series: Arc<DashMap<SeriesKey, SeriesValue>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all observations for `name`, across labels.
    pub fn total(&self, name: &str) -> f64 {
        self.series
            .iter()
            .filter(|entry| entry.key().name == name)
            .map(|entry| entry.value().sum)
            .sum()
    }

    /// Sum of observations for `name` whose labels include every pair in `labels`.
    pub fn total_with(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.series
            .iter()
            .filter(|entry| {
                entry.key().name == name
                    && labels
                        .iter()
                        .all(|(k, v)| entry.key().labels.get(*k).map(|l| l == v).unwrap_or(false))
            })
            .map(|entry| entry.value().sum)
            .sum()
    }

    pub fn snapshot(&self) -> BTreeMap<SeriesKey, SeriesValue> {
        self.series
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Render series in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();
        for (key, value) in self.snapshot() {
            output.push_str(&format!("{} {}\n", key.render(), value.sum));
        }
        output
    }
}

impl MetricsSink for InMemoryMetrics {
    fn emit(&self, event: MetricEvent) {
        let key = SeriesKey {
            name: event.name,
            labels: event.labels,
        };
        let mut entry = self.series.entry(key).or_default();
        entry.sum += event.value;
        entry.count += 1;
    }
}

/// Writes each observation as a debug-level structured log line.
#[derive(Debug, Clone, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn emit(&self, event: MetricEvent) {
        debug!(
            metric = %event.name,
            value = event.value,
            labels = ?event.labels,
            "metric"
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn emit(&self, _event: MetricEvent) {}
}
