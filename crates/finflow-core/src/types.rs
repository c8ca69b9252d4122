use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CoreError, Result};

// Identifiers

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| CoreError::InvalidId(s.to_string()))
    }
}

/// Content fingerprint: lowercase hex SHA-256 of the raw document bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint raw bytes. Identical input always yields an identical value.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a previously computed fingerprint.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let valid = value.len() == 64
            && value
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(CoreError::InvalidId(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character prefix used for sharded storage layouts.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }

    /// Abbreviated form for logs and terminal output.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version label of the pipeline logic that produced a run's artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineVersion(String);

impl PipelineVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PipelineVersion {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl std::fmt::Display for PipelineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// Lifecycle

/// Stage of a pipeline run.
///
/// Lifecycle stages advance strictly along
/// `INGESTED -> CLASSIFIED -> EXTRACTED -> TRANSFORMED -> VALIDATED -> LOADED`.
/// `REJECTED`, `FAILED` and `CANCELLED` are reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Ingested,
    Classified,
    Extracted,
    Transformed,
    Validated,
    Loaded,
    Rejected,
    Failed,
    Cancelled,
}

impl Stage {
    /// The fixed lifecycle graph, in order.
    pub const LIFECYCLE: [Stage; 6] = [
        Stage::Ingested,
        Stage::Classified,
        Stage::Extracted,
        Stage::Transformed,
        Stage::Validated,
        Stage::Loaded,
    ];

    /// Position on the lifecycle graph, `None` for off-graph terminals.
    pub fn ordinal(self) -> Option<usize> {
        Self::LIFECYCLE.iter().position(|s| *s == self)
    }

    /// Successor on the lifecycle graph.
    pub fn next(self) -> Option<Stage> {
        self.ordinal()
            .and_then(|i| Self::LIFECYCLE.get(i + 1))
            .copied()
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Stage::Loaded | Stage::Rejected | Stage::Failed | Stage::Cancelled
        )
    }

    pub fn can_transition_to(self, to: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Stage::Rejected | Stage::Failed | Stage::Cancelled => true,
            _ => self.next() == Some(to),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingested => "INGESTED",
            Stage::Classified => "CLASSIFIED",
            Stage::Extracted => "EXTRACTED",
            Stage::Transformed => "TRANSFORMED",
            Stage::Validated => "VALIDATED",
            Stage::Loaded => "LOADED",
            Stage::Rejected => "REJECTED",
            Stage::Failed => "FAILED",
            Stage::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let stage = match s.trim().to_ascii_uppercase().as_str() {
            "INGESTED" => Stage::Ingested,
            "CLASSIFIED" => Stage::Classified,
            "EXTRACTED" => Stage::Extracted,
            "TRANSFORMED" => Stage::Transformed,
            "VALIDATED" => Stage::Validated,
            "LOADED" => Stage::Loaded,
            "REJECTED" => Stage::Rejected,
            "FAILED" => Stage::Failed,
            "CANCELLED" => Stage::Cancelled,
            other => return Err(CoreError::UnknownStage(other.to_string())),
        };
        Ok(stage)
    }
}

/// Coarse outcome of a run, derived from its stage except for halted runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Rejected,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Loaded => RunStatus::Succeeded,
            Stage::Rejected => RunStatus::Rejected,
            Stage::Failed => RunStatus::Failed,
            Stage::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Running,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Rejected => "rejected",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy shared by every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// I/O against an adapter or store; retried with backoff.
    Transient,
    /// Input the transformer or validator cannot reconcile; never retried.
    Deterministic,
    /// Isolated page or optional sink failure; recorded, run continues.
    Partial,
    /// Corrupt or unsupported input detected at intake.
    Fatal,
}

/// An error or partial failure recorded against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIssue {
    pub stage: Stage,
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl RunIssue {
    pub fn new(stage: Stage, class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            stage,
            class,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Where a submitted document came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Upstream origin (mailbox, upload, scanner id)
    pub origin: Option<String>,
    /// Original filename
    pub filename: Option<String>,
    /// When the document was received upstream
    pub received_at: DateTime<Utc>,
    /// Free-form metadata
    #[serde(default)]
    pub custom: HashMap<String, serde_json::Value>,
}

impl SourceMetadata {
    pub fn new() -> Self {
        Self {
            origin: None,
            filename: None,
            received_at: Utc::now(),
            custom: HashMap::new(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

impl Default for SourceMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable record of one pass of a document through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub fingerprint: Fingerprint,
    pub stage: Stage,
    pub status: RunStatus,
    /// Last lifecycle stage committed, kept when the run leaves the graph.
    pub progress_stage: Stage,
    pub attempts_per_stage: BTreeMap<Stage, u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pipeline_version: PipelineVersion,
    pub source: SourceMetadata,
    #[serde(default)]
    pub errors: Vec<RunIssue>,
    #[serde(default)]
    pub replay_of: Option<RunId>,
}

impl PipelineRun {
    pub fn new(fingerprint: Fingerprint, pipeline_version: PipelineVersion, source: SourceMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            fingerprint,
            stage: Stage::Ingested,
            status: RunStatus::Running,
            progress_stage: Stage::Ingested,
            attempts_per_stage: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            pipeline_version,
            source,
            errors: Vec::new(),
            replay_of: None,
        }
    }

    pub fn replaying(mut self, source_run: RunId) -> Self {
        self.replay_of = Some(source_run);
        self
    }

    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempts_per_stage.get(&stage).copied().unwrap_or(0)
    }

    pub fn set_attempts(&mut self, stage: Stage, attempts: u32) {
        self.attempts_per_stage.insert(stage, attempts);
    }

    pub fn push_issue(&mut self, issue: RunIssue) {
        self.errors.push(issue);
    }

    /// Most recent error detail.
    pub fn latest_error(&self) -> Option<&RunIssue> {
        self.errors.last()
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Move to `to`, enforcing the lifecycle graph.
    pub fn advance(&mut self, to: Stage) -> Result<()> {
        if !self.stage.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        self.status = RunStatus::for_stage(to);
        if to.ordinal().is_some() {
            self.progress_stage = to;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark a run whose terminal stage could not be audited. The stage keeps
    /// its last audited value; only the status says the run is over.
    pub fn halt(&mut self, issue: RunIssue) {
        self.errors.push(issue);
        self.status = RunStatus::Failed;
        self.updated_at = Utc::now();
    }

    /// Lifecycle progress, 0 at intake and 100 once loaded.
    pub fn progress_percent(&self) -> u8 {
        let last = Stage::LIFECYCLE.len() - 1;
        let done = self.progress_stage.ordinal().unwrap_or(0);
        ((done * 100) / last) as u8
    }
}

/// Boundary view returned by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub run_id: RunId,
    pub fingerprint: Fingerprint,
    pub stage: Stage,
    pub status: RunStatus,
    pub progress_percent: u8,
    pub pipeline_version: PipelineVersion,
    pub errors: Vec<RunIssue>,
    pub updated_at: DateTime<Utc>,
}

impl From<&PipelineRun> for StatusReport {
    fn from(run: &PipelineRun) -> Self {
        Self {
            run_id: run.id,
            fingerprint: run.fingerprint.clone(),
            stage: run.stage,
            status: run.status,
            progress_percent: run.progress_percent(),
            pipeline_version: run.pipeline_version.clone(),
            errors: run.errors.clone(),
            updated_at: run.updated_at,
        }
    }
}
