//! Stored run outputs

use anyhow::Result;
use std::process::ExitCode;
use tabled::{Table, Tabled};

use finflow_pipeline::RunResult;

use super::{parse_run_id, Context};
use crate::output;

#[derive(Tabled)]
struct TargetRow {
    #[tabled(rename = "Sink")]
    name: String,
    #[tabled(rename = "Required")]
    required: bool,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Last error")]
    last_error: String,
}

pub async fn run(ctx: &Context, run_id: &str) -> Result<ExitCode> {
    let run_id = parse_run_id(run_id)?;
    let orchestrator = ctx.orchestrator().await?;
    let result = orchestrator.get_result(run_id).await?;

    output::emit(&result, ctx.format, print_result)?;
    Ok(ExitCode::SUCCESS)
}

fn print_result(result: &RunResult) {
    output::key_value("Run", result.run_id);
    output::key_value("Stage", output::stage(result.stage));
    output::key_value("Pipeline version", &result.pipeline_version);

    if let Some(classification) = &result.classification {
        output::section("Classification");
        output::key_value("Type", output::label(&classification.document_type));
        output::key_value("Confidence", format!("{:.2}", classification.confidence));
        output::key_value("Scanned", classification.is_scanned);
        output::key_value("Tables", classification.has_tables);
    }

    if let Some(record) = &result.canonical_record {
        output::section("Record");
        output::key_value("Vendor", record.vendor.as_deref().unwrap_or("-"));
        output::key_value("Invoice", record.invoice_number.as_deref().unwrap_or("-"));
        output::key_value("Line items", record.line_items.len());
        output::key_value("Total", format!("{} {}", record.total, record.currency));
    }

    if let Some(validation) = &result.validation {
        output::section("Validation");
        output::key_value("Valid", validation.is_valid);
        for issue in &validation.errors {
            println!("  error   {} {}", output::label(&issue.code), issue.message);
        }
        for issue in &validation.warnings {
            println!("  warning {} {}", output::label(&issue.code), issue.message);
        }
    }

    if !result.page_errors.is_empty() {
        output::section("Page errors");
        for failure in &result.page_errors {
            println!("  page {} after {} attempts", failure.page_index, failure.attempts);
        }
    }

    if !result.load_targets.is_empty() {
        output::section("Load targets");
        let rows: Vec<TargetRow> = result
            .load_targets
            .iter()
            .map(|t| TargetRow {
                name: t.target_name.clone(),
                required: t.required,
                status: output::label(&t.status),
                attempts: t.attempts,
                last_error: t.last_error.clone().unwrap_or_default(),
            })
            .collect();
        println!("{}", Table::new(rows));
    }

    if !result.errors.is_empty() {
        output::section("Errors");
        for issue in &result.errors {
            println!("  [{}] {}", issue.stage, issue.message);
        }
    }
}
