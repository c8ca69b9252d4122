//! CLI command implementations

pub mod audit;
pub mod config;
pub mod replay;
pub mod result;
pub mod run;
pub mod runs;
pub mod status;

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;

use finflow_core::{Fingerprint, PipelineSettings, RunId, Stage};
use finflow_infra::{
    CompositeAuditSink, FsStore, JsonFileSink, JsonlAuditLog, MemoryLeaseManager, TracingAuditSink, TracingMetrics,
};
use finflow_pipeline::Orchestrator;

use crate::output::OutputFormat;

/// Options shared by every command.
pub struct Context {
    pub data_dir: PathBuf,
    pub config: Option<PathBuf>,
    pub format: OutputFormat,
}

impl Context {
    pub fn settings(&self) -> Result<PipelineSettings> {
        PipelineSettings::load_from(self.config.as_ref()).context("Failed to load pipeline settings")
    }

    /// Orchestrator backed by the data directory. Audit events go to
    /// `audit.jsonl` and are mirrored to the log; every configured sink is a
    /// JSON file sink under `sinks/<name>`.
    pub async fn orchestrator(&self) -> Result<Orchestrator> {
        let settings = self.settings()?;

        let store = FsStore::open(&self.data_dir)
            .await
            .with_context(|| format!("Failed to open data directory {}", self.data_dir.display()))?;
        let audit = JsonlAuditLog::open(self.data_dir.join("audit.jsonl"))
            .await
            .context("Failed to open audit log")?;
        let audit = CompositeAuditSink::new()
            .with_sink(Arc::new(audit))
            .with_sink(Arc::new(TracingAuditSink));

        let sinks_dir = self.data_dir.join("sinks");
        let sinks: Vec<JsonFileSink> = settings
            .load
            .sinks
            .iter()
            .map(|s| JsonFileSink::new(s.name.clone(), sinks_dir.join(&s.name)))
            .collect();

        debug!(
            data_dir = %self.data_dir.display(),
            version = %settings.pipeline_version,
            sinks = sinks.len(),
            "Opening orchestrator"
        );
        let mut builder = Orchestrator::builder(settings)
            .with_store(Arc::new(store))
            .with_audit(Arc::new(audit))
            .with_leases(Arc::new(MemoryLeaseManager::new()))
            .with_metrics(Arc::new(TracingMetrics));
        for sink in sinks {
            builder = builder.with_sink(Arc::new(sink));
        }

        Ok(builder.build()?)
    }
}

pub fn parse_run_id(value: &str) -> Result<RunId> {
    Ok(value.parse::<RunId>()?)
}

pub fn parse_fingerprint(value: &str) -> Result<Fingerprint> {
    Ok(Fingerprint::parse(value)?)
}

pub fn parse_stage(value: &str) -> Result<Stage> {
    Ok(value.parse::<Stage>()?)
}

/// Process exit code for a finished run: 0 loaded, 2 rejected, 1 otherwise.
pub fn exit_code(stage: Stage) -> ExitCode {
    match stage {
        Stage::Loaded => ExitCode::SUCCESS,
        Stage::Rejected => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_stage("validated").unwrap(), Stage::Validated);
        assert!(parse_stage("shipped").is_err());
        assert!(parse_run_id("not-a-uuid").is_err());
        assert!(parse_fingerprint("abc").is_err());

        let fp = Fingerprint::of(b"invoice");
        assert_eq!(parse_fingerprint(fp.as_str()).unwrap(), fp);
    }

    #[tokio::test]
    async fn test_orchestrator_opens_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            data_dir: dir.path().to_path_buf(),
            config: None,
            format: OutputFormat::Json,
        };
        let orchestrator = ctx.orchestrator().await.unwrap();
        assert_eq!(orchestrator.active_runs(), 0);
        assert!(dir.path().join("audit.jsonl").exists());
    }

    #[tokio::test]
    async fn test_runs_survive_reopening_data_dir() {
        use finflow_core::SourceMetadata;
        use finflow_pipeline::Disposition;

        let invoice = "ACME Supplies Ltd\n\
            INVOICE\n\
            Invoice Number: INV-2001\n\
            Invoice Date: 2024-05-01\n\
            Subtotal: 200.00\n\
            Tax: 16.00\n\
            Total: 216.00 USD";

        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            data_dir: dir.path().to_path_buf(),
            config: None,
            format: OutputFormat::Json,
        };

        let first = ctx.orchestrator().await.unwrap();
        let submission = first
            .submit(invoice.as_bytes().to_vec(), SourceMetadata::new().with_filename("inv.txt"))
            .await
            .unwrap();
        assert_eq!(submission.disposition, Disposition::Started);
        let report = first.wait(submission.run_id).await.unwrap();
        assert_eq!(report.stage, Stage::Loaded);
        assert!(dir.path().join("sinks").join("relational").exists());

        let reopened = ctx.orchestrator().await.unwrap();
        let status = reopened.get_status(submission.run_id).await.unwrap();
        assert_eq!(status.stage, Stage::Loaded);
        assert!(!reopened.audit_trail(submission.run_id).await.unwrap().is_empty());

        let again = reopened
            .submit(invoice.as_bytes().to_vec(), SourceMetadata::new())
            .await
            .unwrap();
        assert_eq!(again.disposition, Disposition::CacheHit);
        assert_eq!(again.run_id, submission.run_id);
    }
}
