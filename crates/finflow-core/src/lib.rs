//! Core types, collaborator contracts, and configuration for finflow.

pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod record;
pub mod traits;
pub mod types;

pub use config::*;
pub use document::*;
pub use error::*;
pub use events::{metric_names, AuditEvent, AuditOutcome, MetricEvent};
pub use record::*;
pub use types::*;

pub use traits::{
    AdapterError, ArtifactKind, AuditSink, BlobStore, ExtractionAdapter, FingerprintEntry, FingerprintStore, Lease,
    LeaseManager, LeaseOutcome, MetricsSink, PutOutcome, RunStore, RunStoreExt, SinkAck, SinkError, StorageSink,
    StoredRecord,
};
