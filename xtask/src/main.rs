//! Build automation tasks for cdcflow
//!
//! - Generating the CLI reference from the clap definitions

use anyhow::Context;
use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for cdcflow", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in Markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<cdcflow_ingest::Cli>();

    let content = format!(
        r#"# cdcflow-ingest CLI Reference

This documentation is auto-generated from the CLI source code. Last updated: {}.

## Overview

`cdcflow-ingest` runs change-data-capture jobs: dumpers push captured changes into bounded
channels, importers drain them into a sink, and acknowledged positions are persisted so a
rerun resumes where the last one stopped.

## Quick Start

```bash
# Two tasks, unsorted, one consumer per task
cdcflow-ingest run --tasks 2 --records 10000

# Recover global commit order across tasks
cdcflow-ingest run --tasks 4 --sorted

# Parallel consumers per task, resumable positions and a JSON report
cdcflow-ingest run --consumers 4 --position-dir ./positions --report report.json

# Inspect the effective configuration
cdcflow-ingest show-config --config cdcflow.toml
```

## Commands

{}

## Environment Variables

| Variable | Default |
|---|---|
| `CDCFLOW_CHANNEL_CAPACITY` | `2000` |
| `CDCFLOW_CONSUMER_CONCURRENCY` | `1` |
| `CDCFLOW_IMPORTER_BATCH_SIZE` | `1000` |
| `CDCFLOW_IMPORTER_FETCH_TIMEOUT` | `100` |
| `CDCFLOW_IMPORTER_FETCH_TIMEOUT_UNIT` | `milliseconds` |
| `CDCFLOW_IMPORTER_SORTED` | `false` |
| `CDCFLOW_IMPORTER_ACK_MODE` | `immediate` |
| `CDCFLOW_IMPORTER_MAX_PENDING_ACKS` | `64` |
| `CDCFLOW_RATE_LIMIT_KIND` | unset (`qps` or `tps`) |
| `CDCFLOW_RATE_LIMIT_PERMITS` | unset |
| `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR` | `info`, `console`, `text`, `./logs` |

## Configuration File

```toml
[channel]
capacity = 2000
consumer_concurrency = 4

[importer]
batch_size = 1000
fetch_timeout = 100
fetch_timeout_unit = "milliseconds"
sorted = false
ack_mode = "immediate"
max_pending_acks = 64

[rate_limit]
kind = "tps"
permits_per_second = 5000
```

---

*This documentation is automatically generated from the CLI source code. To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());
    Ok(())
}
