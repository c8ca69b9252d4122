//! Settings inspection

use anyhow::Result;
use std::process::ExitCode;

use super::Context;
use crate::output::{self, OutputFormat};
use crate::ConfigCommands;

pub fn run(ctx: &Context, cmd: ConfigCommands) -> Result<ExitCode> {
    match cmd {
        ConfigCommands::Show => show(ctx),
        ConfigCommands::Validate => validate(ctx),
    }
}

fn show(ctx: &Context) -> Result<ExitCode> {
    let settings = ctx.settings()?;
    let rendered = match ctx.format {
        OutputFormat::Text => toml::to_string_pretty(&settings)?,
        format => output::format_output(&settings, format)?,
    };
    println!("{}", rendered);
    Ok(ExitCode::SUCCESS)
}

fn validate(ctx: &Context) -> Result<ExitCode> {
    match ctx.settings() {
        Ok(settings) => {
            output::success(&format!(
                "Settings are valid (pipeline version {}, {} sink(s))",
                settings.pipeline_version,
                settings.load.sinks.len()
            ));
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            output::error(&format!("{:#}", e));
            Ok(ExitCode::FAILURE)
        }
    }
}
