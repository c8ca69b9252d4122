//! Document submission

use anyhow::{Context as _, Result};
use std::path::Path;
use std::process::ExitCode;

use finflow_core::{RunStatus, SourceMetadata};
use finflow_pipeline::Disposition;

use super::{exit_code, status::print_report, Context};
use crate::output::{self, OutputFormat};

pub async fn run(ctx: &Context, file: &Path, origin: Option<String>) -> Result<ExitCode> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut source = SourceMetadata::new().with_origin(origin.unwrap_or_else(|| "cli".to_string()));
    if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
        source = source.with_filename(name);
    }

    let orchestrator = ctx.orchestrator().await?;
    let submission = orchestrator.submit(bytes, source).await?;
    if ctx.format == OutputFormat::Text {
        output::info(&format!(
            "{} run {} for {}",
            submission.disposition.as_str(),
            submission.run_id,
            submission.fingerprint.short()
        ));
    }

    let report = match submission.disposition {
        Disposition::Started => orchestrator.wait(submission.run_id).await?,
        _ => orchestrator.get_status(submission.run_id).await?,
    };

    output::emit(&report, ctx.format, |report| {
        match report.status {
            RunStatus::Succeeded => output::success("Document loaded"),
            RunStatus::Rejected => output::warning("Document rejected"),
            _ => output::error("Run did not complete"),
        }
        print_report(report);
    })?;
    Ok(exit_code(report.stage))
}
