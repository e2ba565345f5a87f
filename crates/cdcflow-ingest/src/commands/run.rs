//! `run` command: a job over synthetic change streams into a memory sink

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::dumper::{CsnSequence, Dumper, SyntheticDumper, SyntheticSource};
use crate::importer::AckMode;
use crate::job::{DumperContext, JobAckHandle, JobReport, JobStatus, PipelineJob};
use crate::position::{JsonFilePositionRepository, MemoryPositionRepository, PositionRepository};
use crate::sink::MemorySink;
use crate::RunArgs;

/// Pause between sweeps of the deferred-mode sink acker
const SINK_ACK_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration file and environment, then command-line overrides
pub fn effective_config(args: &RunArgs) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(args.config.as_deref())?;
    if args.sorted {
        config.importer.sorted = true;
    }
    if let Some(consumers) = args.consumers {
        config.channel.consumer_concurrency = consumers;
    }
    config.validate()?;
    Ok(config)
}

pub fn task_ids(args: &RunArgs) -> Vec<String> {
    (0..args.tasks)
        .map(|index| format!("{}.task-{}", args.job_id, index))
        .collect()
}

/// Prepare the job without starting it
pub fn prepare(args: &RunArgs, config: &PipelineConfig, sink: Arc<MemorySink>) -> Result<PipelineJob> {
    if args.tasks == 0 {
        anyhow::bail!("--tasks must be greater than 0");
    }

    let repository: Arc<dyn PositionRepository> = match &args.position_dir {
        Some(dir) => Arc::new(
            JsonFilePositionRepository::new(dir)
                .with_context(|| format!("Failed to open position directory {}", dir.display()))?,
        ),
        None => Arc::new(MemoryPositionRepository::new()),
    };

    let csn = config.importer.sorted.then(|| Arc::new(CsnSequence::new()));
    let rate_limit = config.rate_limit.as_ref().map(|c| c.build()).transpose()?;
    let tables = args.tables.max(1);
    let keys = args.keys;
    let records = args.records;
    let push_size = args.push_size;

    let factory = move |ctx: &DumperContext| -> cdcflow_common::Result<Box<dyn Dumper>> {
        let source = SyntheticSource {
            batch_size: push_size,
            ..SyntheticSource::new(
                (0..tables)
                    .map(|table| format!("task{}_t{}", ctx.task_index, table))
                    .collect(),
                keys,
                records,
            )
        };
        let mut dumper = SyntheticDumper::new(ctx.task_id.clone(), source)
            .resume_from(ctx.resume_from.clone())
            .with_rate_limit(rate_limit.clone());
        if let Some(sequence) = &csn {
            dumper = dumper.with_csn(sequence.clone());
        }
        Ok(Box::new(dumper))
    };

    let job = PipelineJob::prepare(
        args.job_id.clone(),
        &task_ids(args),
        config,
        sink,
        repository,
        factory,
    )?;
    Ok(job)
}

/// Run the job until it ends or ctrl-c stops it
pub async fn run(args: RunArgs) -> Result<JobReport> {
    let config = effective_config(&args)?;
    info!(config = %serde_json::to_string(&config)?, "Effective configuration");

    let sink = Arc::new(MemorySink::new());
    let mut job = prepare(&args, &config, sink.clone())?;
    let stop = job.stop_handle();
    let acker_done = Arc::new(AtomicBool::new(false));
    let acker = match config.importer.ack_mode {
        AckMode::Deferred => Some(spawn_sink_acker(
            sink.clone(),
            job.ack_handle(),
            acker_done.clone(),
        )?),
        AckMode::Immediate => None,
    };
    job.start()?;

    let mut waiter = tokio::task::spawn_blocking(move || job.wait());
    let joined = tokio::select! {
        joined = &mut waiter => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, stopping job");
            stop.stop();
            waiter.await
        },
    };

    acker_done.store(true, Ordering::Release);
    if let Some(acker) = acker {
        if acker.join().is_err() {
            warn!("Sink acker thread panicked");
        }
    }
    let report = joined.context("Job wait task failed")??;

    info!(
        rows = sink.row_count(),
        batches = sink.written_batches().len(),
        "Sink state"
    );

    if let Some(path) = &args.report {
        write_report(path, &report)?;
    }
    if report.status == JobStatus::Failed {
        anyhow::bail!("Job failed: {}", report.errors.join("; "));
    }
    Ok(report)
}

/// Confirm every batch the memory sink has written, oldest first, the way a target
/// that commits asynchronously would. Stops once `done` is set and a last sweep ran.
fn spawn_sink_acker(
    sink: Arc<MemorySink>,
    acks: JobAckHandle,
    done: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("sink-acker".to_string())
        .spawn(move || {
            let mut cursor = 0;
            loop {
                let last_sweep = done.load(Ordering::Acquire);
                for ack_id in sink.ack_ids_since(cursor) {
                    if let Err(e) = acks.ack(&ack_id) {
                        warn!(ack_id = %ack_id, error = %e, "Sink ack failed, retrying");
                        break;
                    }
                    cursor += 1;
                }
                if last_sweep {
                    break;
                }
                thread::sleep(SINK_ACK_INTERVAL);
            }
        })
        .context("Failed to spawn sink acker")?;
    Ok(handle)
}

pub fn write_report(path: &Path, report: &JobReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    info!(path = %path.display(), "Report written");
    Ok(())
}
