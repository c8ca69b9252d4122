//! Audit trail

use anyhow::Result;
use std::process::ExitCode;
use tabled::{Table, Tabled};

use finflow_core::AuditEvent;

use super::{parse_run_id, Context};
use crate::output;

#[derive(Tabled)]
struct EventRow {
    #[tabled(rename = "Time")]
    timestamp: String,
    #[tabled(rename = "From")]
    from: String,
    #[tabled(rename = "To")]
    to: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Version")]
    version: String,
}

pub async fn run(ctx: &Context, run_id: &str) -> Result<ExitCode> {
    let run_id = parse_run_id(run_id)?;
    let orchestrator = ctx.orchestrator().await?;
    let events = orchestrator.audit_trail(run_id).await?;

    output::emit(&events, ctx.format, print_events)?;
    Ok(ExitCode::SUCCESS)
}

fn print_events(events: &Vec<AuditEvent>) {
    if events.is_empty() {
        output::info("No audit events recorded.");
        return;
    }

    let rows: Vec<EventRow> = events
        .iter()
        .map(|e| EventRow {
            timestamp: e.timestamp.to_rfc3339(),
            from: e.from_stage.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            to: e.to_stage.to_string(),
            outcome: e.outcome.as_str().to_string(),
            version: e.pipeline_version.to_string(),
        })
        .collect();
    println!("{}", Table::new(rows));
}
