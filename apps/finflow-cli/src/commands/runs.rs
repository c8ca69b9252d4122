//! Run history per fingerprint

use anyhow::Result;
use std::process::ExitCode;
use tabled::{Table, Tabled};

use finflow_core::PipelineRun;

use super::{parse_fingerprint, Context};
use crate::output;

#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "Run")]
    id: String,
    #[tabled(rename = "Stage")]
    stage: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Replay of")]
    replay_of: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

pub async fn run(ctx: &Context, fingerprint: &str) -> Result<ExitCode> {
    let fingerprint = parse_fingerprint(fingerprint)?;
    let orchestrator = ctx.orchestrator().await?;
    let runs = orchestrator.runs(&fingerprint).await?;

    output::emit(&runs, ctx.format, print_runs)?;
    Ok(ExitCode::SUCCESS)
}

fn print_runs(runs: &Vec<PipelineRun>) {
    if runs.is_empty() {
        output::info("No runs recorded for this fingerprint.");
        return;
    }

    let rows: Vec<RunRow> = runs
        .iter()
        .map(|r| RunRow {
            id: r.id.to_string(),
            stage: r.stage.to_string(),
            version: r.pipeline_version.to_string(),
            replay_of: r.replay_of.map(|id| id.to_string()).unwrap_or_default(),
            created_at: r.created_at.to_rfc3339(),
        })
        .collect();
    println!("{}", Table::new(rows));
}
