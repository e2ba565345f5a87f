//! cdcflow Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! The change-data-capture ingestion pipeline: dumpers push captured changes into
//! bounded channels, importers drain them into a sink and acknowledge, and
//! acknowledgements persist the position capture resumes from.
//!
//! # Overview
//!
//! - **Channels**: [`channel::MemoryPipelineChannel`] and the row-routing
//!   [`channel::MultiplexPipelineChannel`]
//! - **Importer**: [`importer::Importer`], unsorted or csn-sorted
//! - **Rate limiting**: [`ratelimit`] QPS and TPS algorithms
//! - **Sinks and positions**: [`sink`], [`position`], [`progress`]
//! - **Jobs**: [`job::PipelineJob`] wires everything onto worker threads
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cdcflow_ingest::config::PipelineConfig;
//! use cdcflow_ingest::dumper::{Dumper, SyntheticDumper, SyntheticSource};
//! use cdcflow_ingest::job::{DumperContext, PipelineJob};
//! use cdcflow_ingest::position::MemoryPositionRepository;
//! use cdcflow_ingest::sink::MemorySink;
//!
//! fn main() -> anyhow::Result<()> {
//!     let tasks = vec!["orders".to_string()];
//!     let mut job = PipelineJob::prepare(
//!         "job-1",
//!         &tasks,
//!         &PipelineConfig::from_env()?,
//!         Arc::new(MemorySink::new()),
//!         Arc::new(MemoryPositionRepository::new()),
//!         |ctx: &DumperContext| -> cdcflow_common::Result<Box<dyn Dumper>> {
//!             let source = SyntheticSource::new(vec!["t_order".into()], 100, 1_000);
//!             Ok(Box::new(SyntheticDumper::new(ctx.task_id.clone(), source)))
//!         },
//!     )?;
//!
//!     job.start()?;
//!     let report = job.wait()?;
//!     println!("{} records applied", report.processed_records());
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod commands;
pub mod config;
pub mod dumper;
pub mod importer;
pub mod job;
pub mod position;
pub mod progress;
pub mod ratelimit;
pub mod sink;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use importer::{AckId, AckMode, Importer};
pub use job::{JobReport, PipelineJob};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// cdcflow - CDC ingestion pipeline
#[derive(Parser, Debug)]
#[command(name = "cdcflow-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job over synthetic change streams
    Run(RunArgs),

    /// Show the effective pipeline configuration
    ShowConfig {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Number of tasks (one dumper and one channel each)
    #[arg(long, default_value = "2")]
    pub tasks: usize,

    /// Data records per task
    #[arg(long, default_value = "10000")]
    pub records: u64,

    /// Tables per task
    #[arg(long, default_value = "2")]
    pub tables: usize,

    /// Unique keys per table
    #[arg(long, default_value = "500")]
    pub keys: u64,

    /// Records per dumper push
    #[arg(long, default_value = "100")]
    pub push_size: usize,

    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Recover global commit order across tasks (overrides the configuration)
    #[arg(long)]
    pub sorted: bool,

    /// Parallel consumers per task (overrides the configuration)
    #[arg(long)]
    pub consumers: Option<usize>,

    /// Persist positions under this directory so a rerun resumes
    #[arg(long)]
    pub position_dir: Option<PathBuf>,

    /// Write the job report as JSON to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Job id, used to derive task ids
    #[arg(long, default_value = "synthetic")]
    pub job_id: String,
}
