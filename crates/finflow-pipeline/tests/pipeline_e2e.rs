//! End-to-end runs through the orchestrator with in-memory backends and
//! fault-injecting collaborators.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use finflow_core::{
    AdapterError, Amount, ArtifactKind, AuditEvent, AuditOutcome, AuditSink, BlobStore, CanonicalRecord,
    ErrorClass, ExtractionAdapter, Fingerprint, IssueCode, LoadStatus, PageAnalysis, PageInput, PipelineSettings,
    PutOutcome, RawExtraction, RetrySettings, RunId, RunStatus, RunStoreExt, SinkAck, SinkError, SinkKind,
    SinkSettings, SourceMetadata, Stage, StorageSink, StoreError,
};
use finflow_infra::{
    InMemoryAuditLog, InMemoryMetrics, MemoryBlobStore, MemoryFingerprintStore, MemoryLeaseManager, MemoryRunStore,
    MemorySink,
};
use finflow_pipeline::{Disposition, Orchestrator, OrchestratorBuilder, PipelineError, TextLayerExtractor};

const INVOICE: &str = "\
ACME Supplies Ltd
123 Market Street
INVOICE
Invoice Number: INV-1001
Invoice Date: 2024-03-01
Due Date: 2024-03-31
Description | Qty | Unit Price | Amount
Widget | 2 | 25.00 | 50.00
Gadget | 1 | 50.00 | 50.00
Subtotal: 100.00
Tax (8%): 8.00
Total: 108.00 USD";

// Collaborators

/// Shared in-memory backends so several orchestrators can see the same history.
struct Stores {
    blobs: Arc<MemoryBlobStore>,
    runs: Arc<MemoryRunStore>,
    fingerprints: Arc<MemoryFingerprintStore>,
    leases: Arc<MemoryLeaseManager>,
    audit: Arc<InMemoryAuditLog>,
    metrics: Arc<InMemoryMetrics>,
}

impl Stores {
    fn new() -> Self {
        Self {
            blobs: Arc::new(MemoryBlobStore::new()),
            runs: Arc::new(MemoryRunStore::new()),
            fingerprints: Arc::new(MemoryFingerprintStore::new()),
            leases: Arc::new(MemoryLeaseManager::new()),
            audit: Arc::new(InMemoryAuditLog::new()),
            metrics: Arc::new(InMemoryMetrics::new()),
        }
    }

    fn builder(&self, settings: PipelineSettings) -> OrchestratorBuilder {
        Orchestrator::builder(settings)
            .with_blob_store(self.blobs.clone())
            .with_run_store(self.runs.clone())
            .with_fingerprint_store(self.fingerprints.clone())
            .with_leases(self.leases.clone())
            .with_audit(self.audit.clone())
            .with_metrics(self.metrics.clone())
    }
}

/// Delegates to the text-layer reader, stalling on one page.
struct StallingAdapter {
    inner: TextLayerExtractor,
    stall_page: Option<u32>,
    delay: Duration,
}

impl StallingAdapter {
    fn on_page(page: u32) -> Self {
        Self {
            inner: TextLayerExtractor::new(),
            stall_page: Some(page),
            delay: Duration::from_secs(30),
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            inner: TextLayerExtractor::new(),
            stall_page: None,
            delay,
        }
    }
}

#[async_trait]
impl ExtractionAdapter for StallingAdapter {
    async fn analyze(&self, page: &PageInput) -> Result<PageAnalysis, AdapterError> {
        if self.stall_page.map(|p| p == page.page_index).unwrap_or(true) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.analyze(page).await
    }

    fn name(&self) -> &str {
        "stalling"
    }
}

struct DownSink {
    name: String,
    calls: AtomicU32,
}

#[async_trait]
impl StorageSink for DownSink {
    async fn upsert(&self, _record: &CanonicalRecord) -> Result<SinkAck, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Transient("index unreachable".into()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct UnavailableBlobStore {
    calls: AtomicU32,
}

#[async_trait]
impl BlobStore for UnavailableBlobStore {
    async fn put(&self, _fingerprint: &Fingerprint, _bytes: &[u8]) -> Result<PutOutcome, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("bucket offline".into()))
    }

    async fn get(&self, blob_ref: &str) -> Result<Vec<u8>, StoreError> {
        Err(StoreError::NotFound(blob_ref.to_string()))
    }
}

/// Delays every write, stretching admission.
struct SlowBlobStore {
    inner: MemoryBlobStore,
    delay: Duration,
}

#[async_trait]
impl BlobStore for SlowBlobStore {
    async fn put(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<PutOutcome, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(fingerprint, bytes).await
    }

    async fn get(&self, blob_ref: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.get(blob_ref).await
    }
}

/// Refuses to persist the listed lifecycle transitions.
struct RefusingAudit {
    inner: InMemoryAuditLog,
    refuse: Vec<Stage>,
}

#[async_trait]
impl AuditSink for RefusingAudit {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError> {
        if self.refuse.contains(&event.to_stage) {
            return Err(StoreError::Io("audit volume read-only".into()));
        }
        self.inner.append(event).await
    }

    async fn events_for_run(&self, run_id: RunId) -> Result<Vec<AuditEvent>, StoreError> {
        self.inner.events_for_run(run_id).await
    }
}

// Helpers

fn fast_retry(max_attempts: u32) -> RetrySettings {
    RetrySettings::default()
        .with_max_attempts(max_attempts)
        .with_initial_delay_ms(1)
        .without_jitter()
}

fn settings(version: &str) -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.pipeline_version = version.to_string();
    settings.intake.retry = fast_retry(3);
    settings.extraction.retry = fast_retry(2);
    settings.runtime.cpu_workers = 2;
    settings.load.sinks = vec![SinkSettings::new("relational", SinkKind::Relational).with_retry(fast_retry(3))];
    settings
}

fn source() -> SourceMetadata {
    SourceMetadata::new().with_origin("e2e").with_filename("invoice.txt")
}

async fn wait(orchestrator: &Orchestrator, run_id: RunId) -> Stage {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait(run_id))
        .await
        .expect("run did not finish in time")
        .unwrap()
        .stage
}

// Scenarios

#[tokio::test]
async fn test_resubmission_is_answered_from_cache() {
    let stores = Stores::new();
    let relational = Arc::new(MemorySink::new("relational"));
    let orchestrator = stores.builder(settings("1")).with_sink(relational.clone()).build().unwrap();

    let first = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    assert_eq!(first.disposition, Disposition::Started);
    assert_eq!(wait(&orchestrator, first.run_id).await, Stage::Loaded);

    let second = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    assert_eq!(second.disposition, Disposition::CacheHit);
    assert_eq!(second.fingerprint, first.fingerprint);
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.status, RunStatus::Succeeded);

    assert_eq!(orchestrator.runs(&first.fingerprint).await.unwrap().len(), 1);
    assert_eq!(relational.len().await, 1);
    assert_eq!(stores.audit.count_outcome(AuditOutcome::CacheHit).await, 1);
}

#[tokio::test]
async fn test_audit_trail_follows_lifecycle() {
    let stores = Stores::new();
    let orchestrator = stores.builder(settings("1")).build().unwrap();

    let submission = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    wait(&orchestrator, submission.run_id).await;
    orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();

    let trail: Vec<AuditEvent> = orchestrator
        .audit_trail(submission.run_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.outcome != AuditOutcome::CacheHit)
        .collect();

    let stages: Vec<Stage> = trail.iter().map(|e| e.to_stage).collect();
    assert_eq!(stages, Stage::LIFECYCLE.to_vec());
    assert_eq!(trail[0].from_stage, None);
    for pair in trail.windows(2) {
        assert_eq!(pair[1].from_stage, Some(pair[0].to_stage));
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }
    assert!(trail.iter().all(|e| e.outcome == AuditOutcome::Advanced));
}

#[tokio::test]
async fn test_total_mismatch_is_rejected() {
    let stores = Stores::new();
    let relational = Arc::new(MemorySink::new("relational"));
    let orchestrator = stores.builder(settings("1")).with_sink(relational.clone()).build().unwrap();

    let bad = INVOICE.replace("Total: 108.00 USD", "Total: 110.00 USD");
    let submission = orchestrator.submit(bad.clone().into_bytes(), source()).await.unwrap();
    assert_eq!(wait(&orchestrator, submission.run_id).await, Stage::Rejected);

    let result = orchestrator.get_result(submission.run_id).await.unwrap();
    assert_eq!(result.status, RunStatus::Rejected);
    let validation = result.validation.unwrap();
    assert!(!validation.is_valid);
    let mismatch = validation.error(IssueCode::TotalMismatch).unwrap();
    assert_eq!(mismatch.difference, Some(Amount::from_minor(200)));

    let status = orchestrator.get_status(submission.run_id).await.unwrap();
    let latest = status.errors.last().unwrap();
    assert_eq!(latest.class, ErrorClass::Deterministic);
    assert!(latest.message.contains("total mismatch"));
    assert_eq!(status.progress_percent, 80);
    assert!(relational.is_empty().await);

    let trail = orchestrator.audit_trail(submission.run_id).await.unwrap();
    let last = trail.last().unwrap();
    assert_eq!(last.outcome, AuditOutcome::Rejected);
    assert_eq!(last.from_stage, Some(Stage::Validated));
    assert!(last.detail["diagnostic"]["errors"].is_array());

    let again = orchestrator.submit(bad.into_bytes(), source()).await.unwrap();
    assert_eq!(again.disposition, Disposition::CacheHit);
    assert_eq!(again.stage, Stage::Rejected);
}

#[tokio::test]
async fn test_page_timeout_is_partial() {
    let stores = Stores::new();
    let mut settings = settings("1");
    settings.extraction.page_timeout_ms = 50;
    let orchestrator = stores
        .builder(settings)
        .with_adapter(Arc::new(StallingAdapter::on_page(1)))
        .build()
        .unwrap();

    let document = format!("{}\x0CTerms: net 30 days", INVOICE);
    let submission = orchestrator.submit(document.into_bytes(), source()).await.unwrap();
    assert_eq!(wait(&orchestrator, submission.run_id).await, Stage::Loaded);

    let trail = orchestrator.audit_trail(submission.run_id).await.unwrap();
    assert!(trail.iter().any(|e| e.to_stage == Stage::Transformed));

    let raw: RawExtraction = stores
        .runs
        .get_typed(submission.run_id, ArtifactKind::Extraction)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw.pages.len(), 2);
    assert!(raw.pages[0].error.is_none());
    assert!(!raw.pages[0].regions.is_empty());
    let page_error = raw.pages[1].error.as_ref().unwrap();
    assert!(page_error.timed_out);
    assert_eq!(raw.pages[1].attempts, 2);

    let result = orchestrator.get_result(submission.run_id).await.unwrap();
    assert_eq!(result.page_errors.len(), 1);
    assert_eq!(result.page_errors[0].page_index, 1);
    assert_eq!(result.canonical_record.unwrap().total, Amount::from_minor(10800));
    assert!(result
        .errors
        .iter()
        .any(|issue| issue.stage == Stage::Extracted && issue.class == ErrorClass::Partial));
}

#[tokio::test]
async fn test_optional_sink_failure_still_loads() {
    let stores = Stores::new();
    let mut settings = settings("1");
    settings.load.sinks.push(
        SinkSettings::new("vector", SinkKind::Vector)
            .optional()
            .with_retry(fast_retry(3)),
    );
    let relational = Arc::new(MemorySink::new("relational"));
    let vector = Arc::new(DownSink {
        name: "vector".into(),
        calls: AtomicU32::new(0),
    });
    let orchestrator = stores
        .builder(settings)
        .with_sink(relational.clone())
        .with_sink(vector.clone())
        .build()
        .unwrap();

    let submission = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    assert_eq!(wait(&orchestrator, submission.run_id).await, Stage::Loaded);

    let result = orchestrator.get_result(submission.run_id).await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    let target = |name: &str| {
        result
            .load_targets
            .iter()
            .find(|t| t.target_name == name)
            .cloned()
            .unwrap()
    };
    assert_eq!(target("relational").status, LoadStatus::Success);
    let vector_status = target("vector");
    assert_eq!(vector_status.status, LoadStatus::FailedPermanent);
    assert!(vector_status.remediation_required);
    assert_eq!(vector_status.attempts, 3);
    assert_eq!(vector.calls.load(Ordering::SeqCst), 3);
    assert_eq!(relational.len().await, 1);

    let issue = result.errors.last().unwrap();
    assert_eq!(issue.stage, Stage::Loaded);
    assert_eq!(issue.class, ErrorClass::Partial);
}

#[tokio::test]
async fn test_required_sink_failure_fails_run() {
    let stores = Stores::new();
    let orchestrator = stores
        .builder(settings("1"))
        .with_sink(Arc::new(DownSink {
            name: "relational".into(),
            calls: AtomicU32::new(0),
        }))
        .build()
        .unwrap();

    let submission = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    assert_eq!(wait(&orchestrator, submission.run_id).await, Stage::Failed);

    let result = orchestrator.get_result(submission.run_id).await.unwrap();
    assert_eq!(result.load_targets[0].status, LoadStatus::FailedPermanent);
    assert!(result.canonical_record.is_some());

    // Failed runs are not cached; the document can be tried again.
    let retry = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    assert_eq!(retry.disposition, Disposition::Started);
    assert_ne!(retry.run_id, submission.run_id);
    wait(&orchestrator, retry.run_id).await;
}

#[tokio::test]
async fn test_staging_retry_is_bounded() {
    let stores = Stores::new();
    let blobs = Arc::new(UnavailableBlobStore {
        calls: AtomicU32::new(0),
    });
    let orchestrator = stores
        .builder(settings("1"))
        .with_blob_store(blobs.clone())
        .build()
        .unwrap();

    let submission = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    assert_eq!(submission.disposition, Disposition::Failed);
    assert_eq!(submission.stage, Stage::Failed);
    assert_eq!(blobs.calls.load(Ordering::SeqCst), 3);

    let runs = orchestrator.runs(&submission.fingerprint).await.unwrap();
    assert_eq!(runs[0].attempts(Stage::Ingested), 3);
    let issue = runs[0].latest_error().unwrap();
    assert_eq!(issue.class, ErrorClass::Transient);
    assert!(issue.message.contains("after 3 attempts"));
    assert_eq!(wait(&orchestrator, submission.run_id).await, Stage::Failed);
}

#[tokio::test]
async fn test_replay_under_new_version_keeps_history() {
    let stores = Stores::new();
    let v1 = stores.builder(settings("1")).build().unwrap();

    let original = v1.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    assert_eq!(wait(&v1, original.run_id).await, Stage::Loaded);
    let trail_before = v1.audit_trail(original.run_id).await.unwrap();

    let v2 = stores.builder(settings("2")).build().unwrap();
    let handle = v2.replay(&original.fingerprint, None).await.unwrap();
    assert_eq!(handle.pipeline_version.as_str(), "2");
    assert_eq!(handle.replay_of, original.run_id);
    assert_eq!(handle.from_stage, Stage::Classified);
    assert_eq!(wait(&v2, handle.new_run_id).await, Stage::Loaded);

    assert_eq!(v2.audit_trail(original.run_id).await.unwrap(), trail_before);
    let original_status = v1.get_status(original.run_id).await.unwrap();
    assert_eq!(original_status.pipeline_version.as_str(), "1");

    let versions: Vec<String> = v2
        .records(&original.fingerprint)
        .await
        .unwrap()
        .iter()
        .map(|r| r.pipeline_version.to_string())
        .collect();
    assert_eq!(versions, vec!["1".to_string(), "2".to_string()]);

    let replayed = v2.get_result(handle.new_run_id).await.unwrap();
    assert_eq!(replayed.canonical_record.unwrap().pipeline_version.as_str(), "2");
}

#[tokio::test]
async fn test_replay_reuses_stages_before_from_stage() {
    let stores = Stores::new();
    let v1 = stores.builder(settings("1")).build().unwrap();
    let original = v1.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    wait(&v1, original.run_id).await;

    let v2 = stores.builder(settings("2")).build().unwrap();
    let handle = v2
        .replay(&original.fingerprint, Some(Stage::Validated))
        .await
        .unwrap();
    assert_eq!(wait(&v2, handle.new_run_id).await, Stage::Loaded);

    let outcomes: Vec<(Stage, AuditOutcome)> = v2
        .audit_trail(handle.new_run_id)
        .await
        .unwrap()
        .iter()
        .map(|e| (e.to_stage, e.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            (Stage::Ingested, AuditOutcome::Reused),
            (Stage::Classified, AuditOutcome::Reused),
            (Stage::Extracted, AuditOutcome::Reused),
            (Stage::Transformed, AuditOutcome::Reused),
            (Stage::Validated, AuditOutcome::Advanced),
            (Stage::Loaded, AuditOutcome::Advanced),
        ]
    );

    let replayed = v2.get_result(handle.new_run_id).await.unwrap();
    assert_eq!(replayed.canonical_record.unwrap().pipeline_version.as_str(), "2");
}

#[tokio::test]
async fn test_cancel_at_stage_boundary() {
    let stores = Stores::new();
    let orchestrator = stores
        .builder(settings("1"))
        .with_adapter(Arc::new(StallingAdapter::slow(Duration::from_millis(300))))
        .build()
        .unwrap();

    let submission = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    assert!(orchestrator.cancel(submission.run_id));
    assert_eq!(wait(&orchestrator, submission.run_id).await, Stage::Cancelled);
    assert!(!orchestrator.cancel(submission.run_id));

    let status = orchestrator.get_status(submission.run_id).await.unwrap();
    assert_eq!(status.status, RunStatus::Cancelled);
    let trail = orchestrator.audit_trail(submission.run_id).await.unwrap();
    assert_eq!(trail.last().unwrap().outcome, AuditOutcome::Cancelled);

    // The lease is released and cancelled runs are not cached.
    let again = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    assert_eq!(again.disposition, Disposition::Started);
    assert_eq!(wait(&orchestrator, again.run_id).await, Stage::Loaded);
}

#[tokio::test]
async fn test_concurrent_submission_returns_in_flight_run() {
    let stores = Stores::new();
    let orchestrator = stores
        .builder(settings("1"))
        .with_adapter(Arc::new(StallingAdapter::slow(Duration::from_millis(200))))
        .build()
        .unwrap();

    let first = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    let second = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    assert_eq!(second.disposition, Disposition::InFlight);
    assert_eq!(second.run_id, first.run_id);

    assert!(matches!(
        orchestrator.replay(&first.fingerprint, None).await,
        Err(PipelineError::LeaseHeld(holder)) if holder == first.run_id
    ));

    assert_eq!(wait(&orchestrator, first.run_id).await, Stage::Loaded);
    assert_eq!(orchestrator.runs(&first.fingerprint).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_transition_without_audit_is_not_committed() {
    let stores = Stores::new();
    let audit = Arc::new(RefusingAudit {
        inner: InMemoryAuditLog::new(),
        refuse: vec![Stage::Extracted],
    });
    let orchestrator = stores.builder(settings("1")).with_audit(audit).build().unwrap();

    let submission = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    assert_eq!(wait(&orchestrator, submission.run_id).await, Stage::Failed);

    let status = orchestrator.get_status(submission.run_id).await.unwrap();
    // Progress stopped at CLASSIFIED: 1 of 5 lifecycle steps.
    assert_eq!(status.progress_percent, 20);
    assert!(status.errors.last().unwrap().message.contains("Audit write failed"));

    let trail = orchestrator.audit_trail(submission.run_id).await.unwrap();
    assert!(trail.iter().all(|e| e.to_stage != Stage::Extracted));
    assert_eq!(trail.last().unwrap().from_stage, Some(Stage::Classified));
}

#[tokio::test]
async fn test_untaxed_total_mismatch_is_rejected() {
    let stores = Stores::new();
    let relational = Arc::new(MemorySink::new("relational"));
    let orchestrator = stores.builder(settings("1")).with_sink(relational.clone()).build().unwrap();

    let untaxed = INVOICE
        .replace("Tax (8%): 8.00\n", "")
        .replace("Total: 108.00 USD", "Total: 500.00 USD");
    let submission = orchestrator.submit(untaxed.into_bytes(), source()).await.unwrap();
    assert_eq!(wait(&orchestrator, submission.run_id).await, Stage::Rejected);

    let validation = orchestrator
        .get_result(submission.run_id)
        .await
        .unwrap()
        .validation
        .unwrap();
    assert!(!validation.is_valid);
    let mismatch = validation.error(IssueCode::TotalMismatch).unwrap();
    assert_eq!(mismatch.difference, Some(Amount::from_minor(40000)));
    assert!(relational.is_empty().await);
}

#[tokio::test]
async fn test_overflowing_amounts_are_rejected() {
    let stores = Stores::new();
    let orchestrator = stores.builder(settings("1")).build().unwrap();

    let document = "\
ACME Supplies Ltd
INVOICE
Invoice Number: INV-9001
Invoice Date: 2024-03-01
Subtotal: 46116860184273879.13
Tax: 46116860184273879.13
Total: 108.00 USD";
    let submission = orchestrator.submit(document.as_bytes().to_vec(), source()).await.unwrap();
    assert_eq!(wait(&orchestrator, submission.run_id).await, Stage::Rejected);

    let status = orchestrator.get_status(submission.run_id).await.unwrap();
    assert_eq!(status.errors.last().unwrap().class, ErrorClass::Deterministic);

    let validation = orchestrator
        .get_result(submission.run_id)
        .await
        .unwrap()
        .validation
        .unwrap();
    assert!(validation.error(IssueCode::AmountOutOfRange).is_some());
}

#[tokio::test]
async fn test_lease_outlives_slow_extraction() {
    let stores = Stores::new();
    let mut settings = settings("1");
    settings.runtime.lease_ttl_ms = 200;
    settings.extraction.page_timeout_ms = 150;
    settings.extraction.workers = 1;
    settings.load.sinks[0].timeout_ms = 100;
    let orchestrator = stores
        .builder(settings)
        .with_adapter(Arc::new(StallingAdapter::slow(Duration::from_millis(100))))
        .build()
        .unwrap();

    // Four pages analyzed one at a time keep extraction busy for two TTLs.
    let document = format!(
        "{}\x0CTerms: net 30 days\x0CTerms: net 30 days\x0CTerms: net 30 days",
        INVOICE
    );
    let first = orchestrator.submit(document.clone().into_bytes(), source()).await.unwrap();
    assert_eq!(first.disposition, Disposition::Started);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(stores.leases.holder(&first.fingerprint), Some(first.run_id));

    let second = orchestrator.submit(document.into_bytes(), source()).await.unwrap();
    assert_eq!(second.disposition, Disposition::InFlight);
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(orchestrator.active_runs(), 1);

    assert_eq!(wait(&orchestrator, first.run_id).await, Stage::Loaded);
    assert_eq!(orchestrator.runs(&first.fingerprint).await.unwrap().len(), 1);
    assert!(stores.leases.holder(&first.fingerprint).is_none());
}

#[tokio::test]
async fn test_submission_during_admission_waits_for_the_holder() {
    let stores = Stores::new();
    let blobs = Arc::new(SlowBlobStore {
        inner: MemoryBlobStore::new(),
        delay: Duration::from_millis(200),
    });
    let orchestrator = stores
        .builder(settings("1"))
        .with_blob_store(blobs)
        .with_adapter(Arc::new(StallingAdapter::slow(Duration::from_millis(200))))
        .build()
        .unwrap();

    let admitting = orchestrator.clone();
    let first = tokio::spawn(async move { admitting.submit(INVOICE.as_bytes().to_vec(), source()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The first submission holds the lease but its run is not persisted yet.
    let second = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.disposition, Disposition::Started);
    assert_eq!(second.disposition, Disposition::InFlight);
    assert_eq!(second.run_id, first.run_id);

    let status = orchestrator.get_status(second.run_id).await.unwrap();
    assert_eq!(status.run_id, first.run_id);
    assert_eq!(wait(&orchestrator, second.run_id).await, Stage::Loaded);

    let third = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    assert_eq!(third.disposition, Disposition::CacheHit);
    assert_eq!(third.run_id, first.run_id);
    assert_eq!(orchestrator.runs(&first.fingerprint).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unrecordable_failure_halts_run() {
    let stores = Stores::new();
    let audit = Arc::new(RefusingAudit {
        inner: InMemoryAuditLog::new(),
        refuse: vec![Stage::Extracted, Stage::Failed],
    });
    let orchestrator = stores.builder(settings("1")).with_audit(audit).build().unwrap();

    let submission = orchestrator.submit(INVOICE.as_bytes().to_vec(), source()).await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), orchestrator.wait(submission.run_id))
        .await
        .expect("run did not finish in time")
        .unwrap();

    // No terminal stage was audited, so none is committed; the status still ends the run.
    assert_eq!(status.stage, Stage::Classified);
    assert_eq!(status.status, RunStatus::Failed);
    assert!(status.errors.last().unwrap().message.contains("was not recorded"));
    assert_eq!(orchestrator.active_runs(), 0);
    assert!(stores.leases.holder(&submission.fingerprint).is_none());

    let trail = orchestrator.audit_trail(submission.run_id).await.unwrap();
    assert!(trail.iter().all(|e| !e.to_stage.is_terminal()));
}
