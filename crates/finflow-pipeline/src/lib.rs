//! Financial document pipeline for finflow
//!
//! Drives raw documents through a fixed six-stage lifecycle:
//!
//! ```text
//! INGESTED -> CLASSIFIED -> EXTRACTED -> TRANSFORMED -> VALIDATED -> LOADED
//! ```
//!
//! with `REJECTED`, `FAILED` and `CANCELLED` as off-graph terminals.
//!
//! # Features
//!
//! - Content-addressed staging with idempotent resubmission
//! - Per-fingerprint leases so a document never has two live runs
//! - Bounded-parallel, per-page extraction tolerant of page failures
//! - Deterministic transformation into a canonical record
//! - Arithmetic and business-rule validation
//! - Independently failable fan-out writes with required/optional sinks
//! - Audit-before-commit stage transitions and versioned replay

pub mod classifier;
pub mod extraction;
pub mod fanout;
pub mod intake;
pub mod jobs;
pub mod normalize;
pub mod orchestrator;
pub mod text_layer;
pub mod transform;
pub mod validate;

pub use classifier::Classifier;
pub use extraction::ExtractionCoordinator;
pub use fanout::{FanoutOutcome, FanoutWriter};
pub use intake::{paginate, DocumentFormat, StagingIntake};
pub use jobs::{JobPlan, ResourcePool, StageJob};
pub use orchestrator::{
    Disposition, Orchestrator, OrchestratorBuilder, PageFailure, ReplayHandle, RunResult, Submission,
};
pub use text_layer::TextLayerExtractor;
pub use transform::{TransformRejection, Transformer};
pub use validate::Validator;

use finflow_core::{CoreError, ErrorClass, RunId, StoreError};

/// Error types for pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unsupported or corrupt document: {0}")]
    Fatal(String),

    #[error("{message} (after {attempts} attempts)")]
    Exhausted { message: String, attempts: u32 },

    #[error("Rejected: {reason}")]
    Rejected {
        reason: String,
        detail: serde_json::Value,
    },

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Nothing to replay for fingerprint {0}")]
    NothingToReplay(String),

    #[error("Invalid replay: {0}")]
    InvalidReplay(String),

    #[error("Fingerprint is leased by in-flight run {0}")]
    LeaseHeld(RunId),

    #[error("Audit write failed, transition not committed: {0}")]
    Audit(StoreError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Worker pool {0} is closed")]
    PoolClosed(String),

    #[error("Stage task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// Failure class used when the error terminates a run.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Fatal(_) => ErrorClass::Fatal,
            PipelineError::Rejected { .. } => ErrorClass::Deterministic,
            _ => ErrorClass::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class() {
        assert_eq!(PipelineError::Fatal("empty".into()).class(), ErrorClass::Fatal);
        assert_eq!(
            PipelineError::Rejected {
                reason: "missing total".into(),
                detail: serde_json::Value::Null,
            }
            .class(),
            ErrorClass::Deterministic
        );
        let exhausted = PipelineError::Exhausted {
            message: "blob store unavailable".into(),
            attempts: 3,
        };
        assert_eq!(exhausted.class(), ErrorClass::Transient);
        assert_eq!(exhausted.to_string(), "blob store unavailable (after 3 attempts)");
    }
}
