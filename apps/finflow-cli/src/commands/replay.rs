//! Versioned replay

use anyhow::Result;
use std::process::ExitCode;

use super::{exit_code, parse_fingerprint, parse_stage, status::print_report, Context};
use crate::output::{self, OutputFormat};

pub async fn run(ctx: &Context, fingerprint: &str, from: Option<&str>) -> Result<ExitCode> {
    let fingerprint = parse_fingerprint(fingerprint)?;
    let from_stage = from.map(parse_stage).transpose()?;

    let orchestrator = ctx.orchestrator().await?;
    let handle = orchestrator.replay(&fingerprint, from_stage).await?;
    if ctx.format == OutputFormat::Text {
        output::info(&format!(
            "Replaying run {} from {} as {} (version {})",
            handle.replay_of, handle.from_stage, handle.new_run_id, handle.pipeline_version
        ));
    }

    let report = orchestrator.wait(handle.new_run_id).await?;
    output::emit(&report, ctx.format, print_report)?;
    Ok(exit_code(report.stage))
}
