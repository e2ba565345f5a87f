//! cdcflow Ingest - CDC ingestion pipeline runner

use anyhow::Result;
use cdcflow_common::logging::{init_logging, LogConfig, LogLevel};
use cdcflow_ingest::{commands, Cli, Commands};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("cdcflow-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    match cli.command {
        Commands::Run(args) => {
            let report = commands::run::run(args).await?;
            info!(
                job_id = %report.job_id,
                status = report.status.as_str(),
                processed_records = report.processed_records(),
                "Run complete"
            );
        },
        Commands::ShowConfig { config } => {
            commands::show_config::run(config.as_deref())?;
        },
    }

    Ok(())
}
