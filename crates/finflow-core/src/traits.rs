//! Contracts for the pipeline's external collaborators.
//!
//! Extraction, storage sinks, and the persistence stores are all reached
//! through these traits so backends can be swapped and mocked in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::document::{PageAnalysis, PageInput};
use crate::error::StoreError;
use crate::events::{AuditEvent, MetricEvent};
use crate::record::CanonicalRecord;
use crate::types::{Fingerprint, PipelineRun, PipelineVersion, RunId, Stage};

// Extraction

/// Failure reported by an extraction adapter.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Worth retrying (throttling, connection reset)
    #[error("Transient adapter error: {0}")]
    Transient(String),

    /// The page cannot be analyzed; retrying will not help
    #[error("Permanent adapter error: {0}")]
    Permanent(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

/// Layout and text analysis capability for a single page.
#[async_trait]
pub trait ExtractionAdapter: Send + Sync {
    async fn analyze(&self, page: &PageInput) -> Result<PageAnalysis, AdapterError>;

    fn name(&self) -> &str;
}

// Storage sinks

/// Acknowledgement of a sink write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkAck {
    pub target: String,
    pub key: String,
    /// False when the upsert replaced an identical existing row
    pub created: bool,
}

#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("Transient sink error: {0}")]
    Transient(String),

    #[error("Permanent sink error: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Downstream target of the fan-out write. `upsert` must be idempotent on
/// `(document_id, pipeline_version)`.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<SinkAck, SinkError>;

    fn name(&self) -> &str;
}

// Audit and metrics

/// Durable, append-only audit log. An `Ok` return means the event is persisted.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError>;

    async fn events_for_run(&self, run_id: RunId) -> Result<Vec<AuditEvent>, StoreError>;
}

/// Fire-and-forget metrics emission. Must never block or fail the pipeline.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: MetricEvent);
}

// Blob store

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub blob_ref: String,
    /// Bytes were already present under this fingerprint
    pub existed: bool,
}

/// Content-addressed raw document storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<PutOutcome, StoreError>;

    async fn get(&self, blob_ref: &str) -> Result<Vec<u8>, StoreError>;
}

// Run store

/// Per-run stage outputs. Each kind is written at most once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Staged,
    Classification,
    Extraction,
    Record,
    Validation,
    /// Pending sink rows written when the run enters the load phase
    LoadPlan,
    LoadTargets,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Staged => "staged",
            ArtifactKind::Classification => "classification",
            ArtifactKind::Extraction => "extraction",
            ArtifactKind::Record => "record",
            ArtifactKind::Validation => "validation",
            ArtifactKind::LoadPlan => "load_plan",
            ArtifactKind::LoadTargets => "load_targets",
        }
    }

    /// Stage whose commit produces this artifact.
    pub fn stage(&self) -> Stage {
        match self {
            ArtifactKind::Staged => Stage::Ingested,
            ArtifactKind::Classification => Stage::Classified,
            ArtifactKind::Extraction => Stage::Extracted,
            ArtifactKind::Record => Stage::Transformed,
            ArtifactKind::Validation => Stage::Validated,
            ArtifactKind::LoadPlan | ArtifactKind::LoadTargets => Stage::Loaded,
        }
    }
}

/// Canonical record stored under `(fingerprint, pipeline_version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub fingerprint: Fingerprint,
    pub pipeline_version: PipelineVersion,
    pub run_id: RunId,
    pub stored_at: DateTime<Utc>,
    pub record: serde_json::Value,
}

/// Durable run state and stage artifacts.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new run. Fails with `Conflict` if the id exists.
    async fn create(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Overwrite the stored state of an existing run.
    async fn update(&self, run: &PipelineRun) -> Result<(), StoreError>;

    async fn get(&self, run_id: RunId) -> Result<Option<PipelineRun>, StoreError>;

    /// Every run for a fingerprint, oldest first.
    async fn runs_for_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Vec<PipelineRun>, StoreError>;

    /// Append-only: writing the same kind twice for a run is a `Conflict`.
    async fn put_artifact(&self, run_id: RunId, kind: ArtifactKind, value: serde_json::Value) -> Result<(), StoreError>;

    async fn get_artifact(&self, run_id: RunId, kind: ArtifactKind) -> Result<Option<serde_json::Value>, StoreError>;

    /// Store a canonical record version. Existing versions are never overwritten.
    async fn put_record(&self, record: StoredRecord) -> Result<(), StoreError>;

    /// Every stored version for a fingerprint, in insertion order.
    async fn records(&self, fingerprint: &Fingerprint) -> Result<Vec<StoredRecord>, StoreError>;
}

/// Typed helpers over the JSON artifact API.
#[async_trait]
pub trait RunStoreExt: RunStore {
    async fn put_typed<T>(&self, run_id: RunId, kind: ArtifactKind, value: &T) -> Result<(), StoreError>
    where
        T: Serialize + Sync,
    {
        let json = serde_json::to_value(value)?;
        self.put_artifact(run_id, kind, json).await
    }

    async fn get_typed<T>(&self, run_id: RunId, kind: ArtifactKind) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Send,
    {
        match self.get_artifact(run_id, kind).await? {
            Some(json) => Ok(Some(serde_json::from_value(json)?)),
            None => Ok(None),
        }
    }
}

impl<S: RunStore + ?Sized> RunStoreExt for S {}

// Fingerprint store

/// Latest known outcome for a fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub fingerprint: Fingerprint,
    pub run_id: RunId,
    pub stage: Stage,
    pub pipeline_version: PipelineVersion,
    pub recorded_at: DateTime<Utc>,
}

/// Fingerprint to latest-run index used for deduplication.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<FingerprintEntry>, StoreError>;

    async fn record(&self, entry: FingerprintEntry) -> Result<(), StoreError>;
}

// Leases

/// Exclusive right to process a fingerprint until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub fingerprint: Fingerprint,
    pub run_id: RunId,
    pub token: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired(Lease),
    /// Another live run owns the fingerprint
    Held { run_id: RunId },
}

/// Per-fingerprint mutual exclusion for in-flight runs.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    async fn acquire(
        &self,
        fingerprint: &Fingerprint,
        run_id: RunId,
        ttl: std::time::Duration,
    ) -> Result<LeaseOutcome, StoreError>;

    /// Extend a lease still held by its owner.
    async fn renew(&self, lease: &Lease, ttl: std::time::Duration) -> Result<Lease, StoreError>;

    async fn release(&self, lease: &Lease) -> Result<(), StoreError>;
}
