//! Audit and metric events emitted by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::types::{PipelineVersion, RunId, Stage};

/// What happened at a stage transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Stage committed and the run moved forward
    Advanced,
    /// Deterministic rejection
    Rejected,
    /// Transient failure exhausted retries, or fatal intake error
    Failed,
    Cancelled,
    /// Submission answered from a previous terminal run
    CacheHit,
    /// Replay reused a stored artifact for this stage
    Reused,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Advanced => "advanced",
            AuditOutcome::Rejected => "rejected",
            AuditOutcome::Failed => "failed",
            AuditOutcome::Cancelled => "cancelled",
            AuditOutcome::CacheHit => "cache_hit",
            AuditOutcome::Reused => "reused",
        }
    }
}

/// Immutable audit record. Appended before the state change it describes is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub run_id: RunId,
    pub pipeline_version: PipelineVersion,
    pub timestamp: DateTime<Utc>,
    pub from_stage: Option<Stage>,
    pub to_stage: Stage,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl AuditEvent {
    pub fn new(run_id: RunId, pipeline_version: PipelineVersion, to_stage: Stage, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            pipeline_version,
            timestamp: Utc::now(),
            from_stage: None,
            to_stage,
            outcome,
            detail: serde_json::Value::Null,
        }
    }

    pub fn from_stage(mut self, stage: Stage) -> Self {
        self.from_stage = Some(stage);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// A single metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl MetricEvent {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            labels: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Counter increment of one.
    pub fn counter(name: impl Into<String>) -> Self {
        Self::new(name, 1.0)
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Metric names emitted by the pipeline.
pub mod metric_names {
    pub const SUBMISSIONS: &str = "finflow_submissions_total";
    pub const STAGE_DURATION_MS: &str = "finflow_stage_duration_ms";
    pub const STAGE_TRANSITIONS: &str = "finflow_stage_transitions_total";
    pub const STAGE_RETRIES: &str = "finflow_stage_retries_total";
    pub const PAGE_FAILURES: &str = "finflow_page_failures_total";
    pub const SINK_WRITES: &str = "finflow_sink_writes_total";
    pub const CACHE_HITS: &str = "finflow_cache_hits_total";
    pub const VALIDATION_FAILURES: &str = "finflow_validation_failures_total";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_serialization() {
        let event = AuditEvent::new(RunId::new(), PipelineVersion::new("1"), Stage::Classified, AuditOutcome::Advanced)
            .from_stage(Stage::Ingested)
            .with_detail(serde_json::json!({"attempts": 1}));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["from_stage"], "INGESTED");
        assert_eq!(json["to_stage"], "CLASSIFIED");
        assert_eq!(json["outcome"], "advanced");

        let back: AuditEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_metric_labels() {
        let metric = MetricEvent::counter(metric_names::SINK_WRITES)
            .with_label("sink", "relational")
            .with_label("status", "success");
        assert_eq!(metric.value, 1.0);
        assert_eq!(metric.labels.len(), 2);
    }
}
