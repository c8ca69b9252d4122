//! Multi-target fan-out writer
//!
//! Upserts a canonical record into every configured sink. Each sink has its
//! own deadline and retry budget and fails independently; only required
//! sinks decide whether the load succeeded.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use finflow_core::{
    metric_names, CanonicalRecord, LoadStatus, LoadTargetStatus, MetricEvent, MetricsSink, SinkError, SinkSettings,
    StorageSink,
};
use finflow_infra::{retry_with, timeout_result, NoopMetrics, RetryPolicy, TimeoutOrError};

/// A sink together with its configuration.
#[derive(Clone)]
pub struct SinkBinding {
    sink: Arc<dyn StorageSink>,
    settings: SinkSettings,
    retry: RetryPolicy,
}

impl SinkBinding {
    pub fn new(sink: Arc<dyn StorageSink>, settings: SinkSettings) -> Self {
        let retry = RetryPolicy::from(&settings.retry);
        Self { sink, settings, retry }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn required(&self) -> bool {
        self.settings.required
    }
}

/// Per-sink results of one fan-out, in configuration order.
#[derive(Debug, Clone, PartialEq)]
pub struct FanoutOutcome {
    pub statuses: Vec<LoadTargetStatus>,
}

impl FanoutOutcome {
    /// Every required sink acknowledged the write.
    pub fn required_ok(&self) -> bool {
        self.statuses
            .iter()
            .filter(|s| s.required)
            .all(|s| s.status == LoadStatus::Success)
    }

    pub fn failed_required(&self) -> impl Iterator<Item = &LoadTargetStatus> {
        self.statuses
            .iter()
            .filter(|s| s.required && s.status == LoadStatus::FailedPermanent)
    }

    pub fn failed_optional(&self) -> impl Iterator<Item = &LoadTargetStatus> {
        self.statuses
            .iter()
            .filter(|s| !s.required && s.status == LoadStatus::FailedPermanent)
    }

    pub fn max_attempts(&self) -> u32 {
        self.statuses.iter().map(|s| s.attempts).max().unwrap_or(0)
    }
}

/// Writes one record to N sinks with bounded concurrency.
#[derive(Clone)]
pub struct FanoutWriter {
    bindings: Vec<SinkBinding>,
    concurrency: usize,
    metrics: Arc<dyn MetricsSink>,
}

impl FanoutWriter {
    pub fn new(concurrency: usize) -> Self {
        Self {
            bindings: Vec::new(),
            concurrency: concurrency.max(1),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn StorageSink>, settings: SinkSettings) -> Self {
        self.bindings.push(SinkBinding::new(sink, settings));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn bindings(&self) -> &[SinkBinding] {
        &self.bindings
    }

    /// One pending row per configured sink, written before any sink is called.
    pub fn pending_statuses(&self) -> Vec<LoadTargetStatus> {
        self.bindings
            .iter()
            .map(|b| LoadTargetStatus::pending(b.name(), b.required()))
            .collect()
    }

    pub async fn write(&self, record: &CanonicalRecord) -> FanoutOutcome {
        let writes: Vec<_> = self
            .bindings
            .iter()
            .map(|binding| self.write_one(binding, record))
            .collect();
        let statuses: Vec<LoadTargetStatus> = stream::iter(writes)
            .buffered(self.concurrency)
            .collect()
            .await;

        let outcome = FanoutOutcome { statuses };
        info!(
            key = %record.upsert_key(),
            sinks = outcome.statuses.len(),
            required_ok = outcome.required_ok(),
            "Fan-out complete"
        );
        outcome
    }

    async fn write_one(&self, binding: &SinkBinding, record: &CanonicalRecord) -> LoadTargetStatus {
        let sink = binding.sink.as_ref();
        let name = binding.name();
        let deadline = binding.settings.timeout();

        let result = retry_with(
            &binding.retry,
            move |attempt| {
                debug!(sink = name, attempt, "Upserting record");
                timeout_result(deadline, name, sink.upsert(record))
            },
            is_retryable,
        )
        .await;

        let pending = LoadTargetStatus::pending(name, binding.required());
        match result {
            Ok(ack) => {
                self.emit(name, "success");
                debug!(sink = name, created = ack.value.created, "Sink write acknowledged");
                pending.succeeded(ack.attempts)
            }
            Err(failure) => {
                self.emit(name, "failed_permanent");
                if binding.required() {
                    error!(sink = name, attempts = failure.attempts, error = %failure.value, "Required sink write failed");
                } else {
                    warn!(sink = name, attempts = failure.attempts, error = %failure.value, "Optional sink write failed");
                }
                pending.failed(failure.attempts, failure.value.to_string())
            }
        }
    }

    fn emit(&self, sink: &str, status: &str) {
        self.metrics.emit(
            MetricEvent::counter(metric_names::SINK_WRITES)
                .with_label("sink", sink)
                .with_label("status", status),
        );
    }
}

fn is_retryable(error: &TimeoutOrError<SinkError>) -> bool {
    match error {
        TimeoutOrError::Timeout(_) => true,
        TimeoutOrError::Error(e) => e.is_transient(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use finflow_core::{Amount, CurrencyCode, PipelineVersion, RetrySettings, SinkAck, SinkKind};
    use finflow_infra::{InMemoryMetrics, MemorySink};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingSink {
        name: String,
        error: SinkError,
        calls: AtomicU32,
    }

    impl FailingSink {
        fn new(name: &str, error: SinkError) -> Self {
            Self {
                name: name.to_string(),
                error,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StorageSink for FailingSink {
        async fn upsert(&self, _record: &CanonicalRecord) -> Result<SinkAck, SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn record() -> CanonicalRecord {
        CanonicalRecord::new(
            "fp",
            PipelineVersion::new("1"),
            Amount::from_minor(10800),
            CurrencyCode::new("USD").unwrap(),
        )
    }

    fn fast_retry(max_attempts: u32) -> RetrySettings {
        RetrySettings::default()
            .with_max_attempts(max_attempts)
            .with_initial_delay_ms(1)
            .without_jitter()
    }

    #[tokio::test]
    async fn test_optional_failure_does_not_block() {
        let relational = Arc::new(MemorySink::new("relational"));
        let vector = Arc::new(FailingSink::new("vector", SinkError::Transient("index offline".into())));
        let metrics = Arc::new(InMemoryMetrics::new());

        let writer = FanoutWriter::new(4)
            .with_sink(relational.clone(), SinkSettings::new("relational", SinkKind::Relational))
            .with_sink(
                vector.clone(),
                SinkSettings::new("vector", SinkKind::Vector)
                    .optional()
                    .with_retry(fast_retry(3)),
            )
            .with_metrics(metrics.clone());

        let pending = writer.pending_statuses();
        assert!(pending.iter().all(|s| s.status == LoadStatus::Pending));

        let outcome = writer.write(&record()).await;
        assert!(outcome.required_ok());
        assert_eq!(outcome.statuses[0].target_name, "relational");
        assert_eq!(outcome.statuses[0].status, LoadStatus::Success);
        assert_eq!(outcome.statuses[1].status, LoadStatus::FailedPermanent);
        assert!(outcome.statuses[1].remediation_required);
        assert_eq!(outcome.statuses[1].attempts, 3);
        assert_eq!(vector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.failed_optional().count(), 1);
        assert_eq!(relational.len().await, 1);
        assert_eq!(
            metrics.total_with(metric_names::SINK_WRITES, &[("sink", "vector"), ("status", "failed_permanent")]),
            1.0
        );
    }

    #[tokio::test]
    async fn test_required_failure_and_permanent_errors_not_retried() {
        let warehouse = Arc::new(FailingSink::new("warehouse", SinkError::Permanent("schema mismatch".into())));
        let writer = FanoutWriter::new(2).with_sink(
            warehouse.clone(),
            SinkSettings::new("warehouse", SinkKind::Relational).with_retry(fast_retry(5)),
        );

        let outcome = writer.write(&record()).await;
        assert!(!outcome.required_ok());
        assert_eq!(outcome.failed_required().count(), 1);
        assert_eq!(warehouse.calls.load(Ordering::SeqCst), 1);
        assert!(outcome.statuses[0].last_error.as_deref().unwrap().contains("schema mismatch"));
    }

    #[tokio::test]
    async fn test_repeated_writes_are_idempotent() {
        let sink = Arc::new(MemorySink::new("relational"));
        let writer = FanoutWriter::new(1).with_sink(sink.clone(), SinkSettings::new("relational", SinkKind::Relational));
        writer.write(&record()).await;
        writer.write(&record()).await;
        assert_eq!(sink.len().await, 1);
    }
}
