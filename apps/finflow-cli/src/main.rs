//! finflow CLI
//!
//! Submits documents to the pipeline and inspects runs, results and audit
//! trails kept under a local data directory.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod output;
mod telemetry;

use output::OutputFormat;

/// finflow - financial document pipeline
#[derive(Parser)]
#[command(name = "finflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Directory holding staged documents, runs, records and audit log
    #[arg(long, env = "FINFLOW_DATA_DIR", default_value = "./finflow-data", global = true)]
    data_dir: PathBuf,

    /// Pipeline settings file (TOML, YAML or JSON)
    #[arg(short, long, env = "FINFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "text", value_parser = ["text", "json", "yaml"], global = true)]
    format: String,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a document and wait for its run to finish
    Run {
        /// Document to submit
        file: PathBuf,

        /// Free-form origin recorded with the source metadata
        #[arg(long)]
        origin: Option<String>,
    },

    /// Show the status of a run
    Status {
        /// Run identifier
        run_id: String,
    },

    /// Show the stored outputs of a run
    Result {
        /// Run identifier
        run_id: String,
    },

    /// Re-run a document under the current pipeline version
    Replay {
        /// Document fingerprint (hex)
        fingerprint: String,

        /// First stage to recompute
        #[arg(long)]
        from: Option<String>,
    },

    /// Show the audit trail of a run
    Audit {
        /// Run identifier
        run_id: String,
    },

    /// List every run recorded for a fingerprint
    Runs {
        /// Document fingerprint (hex)
        fingerprint: String,
    },

    /// Pipeline settings
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective settings
    Show,

    /// Check that the effective settings are usable
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = telemetry::init(&cli.log_level, cli.json_logs) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let format: OutputFormat = cli.format.parse().map_err(anyhow::Error::msg)?;
    let ctx = commands::Context {
        data_dir: cli.data_dir,
        config: cli.config,
        format,
    };

    match cli.command {
        Commands::Run { file, origin } => commands::run::run(&ctx, &file, origin).await,
        Commands::Status { run_id } => commands::status::run(&ctx, &run_id).await,
        Commands::Result { run_id } => commands::result::run(&ctx, &run_id).await,
        Commands::Replay { fingerprint, from } => commands::replay::run(&ctx, &fingerprint, from.as_deref()).await,
        Commands::Audit { run_id } => commands::audit::run(&ctx, &run_id).await,
        Commands::Runs { fingerprint } => commands::runs::run(&ctx, &fingerprint).await,
        Commands::Config(cmd) => commands::config::run(&ctx, cmd),
    }
}
