//! Run status

use anyhow::Result;
use std::process::ExitCode;

use finflow_core::StatusReport;

use super::{parse_run_id, Context};
use crate::output;

pub async fn run(ctx: &Context, run_id: &str) -> Result<ExitCode> {
    let run_id = parse_run_id(run_id)?;
    let orchestrator = ctx.orchestrator().await?;
    let report = orchestrator.get_status(run_id).await?;

    output::emit(&report, ctx.format, print_report)?;
    Ok(ExitCode::SUCCESS)
}

pub fn print_report(report: &StatusReport) {
    output::key_value("Run", report.run_id);
    output::key_value("Fingerprint", &report.fingerprint);
    output::key_value("Stage", output::stage(report.stage));
    output::key_value("Status", output::status(report.status));
    output::key_value("Progress", format!("{}%", report.progress_percent));
    output::key_value("Pipeline version", &report.pipeline_version);
    output::key_value("Updated", report.updated_at.to_rfc3339());

    if !report.errors.is_empty() {
        output::section("Errors");
        for issue in &report.errors {
            println!("  [{}] {} {}", issue.stage, output::label(&issue.class), issue.message);
        }
    }
}
