//! Job preparation and execution
//!
//! A job is a set of tasks. Every task gets one channel (multiplexed when the job asks
//! for several consumers), one progress listener and one dumper. Importers are then
//! assigned so that no pair is ever drained by two importers:
//!
//! - unsorted: one importer per channel/progress pair
//! - sorted: one importer owning every pair of the job, merging by csn
//!
//! Dumpers and importers each run on a named OS thread. Any failure stops the whole
//! job; the failed batch stays unacknowledged and is replayed on the next run.
//!
//! With deferred acks the sink owner confirms written batches through a
//! [`JobAckHandle`]; the job completes once every batch has been confirmed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use cdcflow_common::{IngestPosition, PipelineError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channel::{create_channel, ChannelProducer, ChannelProgressPair, TaskChannel};
use crate::config::PipelineConfig;
use crate::dumper::Dumper;
use crate::importer::{AckId, Importer};
use crate::position::{PositionAckCallback, PositionRepository};
use crate::progress::{JobItemProgress, ProgressSnapshot};
use crate::sink::PipelineSink;

/// What a dumper factory gets to know about the task it builds for
#[derive(Debug, Clone)]
pub struct DumperContext {
    pub task_id: String,
    pub task_index: usize,
    /// Last acknowledged position of the task, if any
    pub resume_from: Option<IngestPosition>,
}

/// Job lifecycle outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Stopped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Completed => "completed",
            JobStatus::Stopped => "stopped",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub progress: ProgressSnapshot,
    pub position: Option<IngestPosition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub tasks: Vec<TaskReport>,
    pub errors: Vec<String>,
}

impl JobReport {
    pub fn processed_records(&self) -> u64 {
        self.tasks.iter().map(|t| t.progress.processed_records).sum()
    }
}

struct JobTask {
    task_id: String,
    channel: TaskChannel,
    progress: Arc<JobItemProgress>,
    dumper: Option<Box<dyn Dumper>>,
}

/// Shared stop switch: halts importers first, then closes channels so blocked
/// producers and consumers wake up.
struct Shutdown {
    stop: AtomicBool,
    importers: Vec<Arc<Importer>>,
    producers: Vec<Arc<dyn ChannelProducer>>,
}

impl Shutdown {
    fn trigger(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        for importer in &self.importers {
            importer.stop();
        }
        for producer in &self.producers {
            producer.close();
        }
    }

    fn is_triggered(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Cloneable handle that stops a running job
#[derive(Clone)]
pub struct JobStopHandle {
    shutdown: Arc<Shutdown>,
}

impl JobStopHandle {
    pub fn stop(&self) {
        info!("Job stop requested");
        self.shutdown.trigger();
    }
}

/// Cloneable handle that routes acknowledgements to the importer that wrote the batch
#[derive(Clone)]
pub struct JobAckHandle {
    importers: Arc<HashMap<Uuid, Arc<Importer>>>,
}

impl JobAckHandle {
    /// Acknowledge `ack_id` and every earlier batch of the same importer.
    pub fn ack(&self, ack_id: &AckId) -> Result<usize> {
        let importer = self
            .importers
            .get(&ack_id.importer)
            .ok_or_else(|| PipelineError::UnknownAckId(ack_id.to_string()))?;
        importer.ack(ack_id)
    }
}

impl std::fmt::Debug for JobAckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobAckHandle")
            .field("importers", &self.importers.len())
            .finish()
    }
}

pub struct PipelineJob {
    job_id: String,
    tasks: Vec<JobTask>,
    importers: Vec<Arc<Importer>>,
    repository: Arc<dyn PositionRepository>,
    shutdown: Arc<Shutdown>,
    errors: Arc<Mutex<Vec<String>>>,
    handles: Vec<JoinHandle<()>>,
    started_at: Option<(DateTime<Utc>, Instant)>,
}

impl PipelineJob {
    /// Wire channels, progress listeners, dumpers and importers for `task_ids`.
    pub fn prepare<F>(
        job_id: impl Into<String>,
        task_ids: &[String],
        config: &PipelineConfig,
        sink: Arc<dyn PipelineSink>,
        repository: Arc<dyn PositionRepository>,
        dumper_factory: F,
    ) -> Result<Self>
    where
        F: Fn(&DumperContext) -> Result<Box<dyn Dumper>>,
    {
        let job_id = job_id.into();
        let rate_limit = config.rate_limit.as_ref().map(|c| c.build()).transpose()?;

        let mut tasks = Vec::with_capacity(task_ids.len());
        let mut pairs = Vec::new();
        for (task_index, task_id) in task_ids.iter().enumerate() {
            let resume_from = repository.load(task_id)?;
            let ack_callback = Arc::new(
                PositionAckCallback::new(task_id.clone(), repository.clone())
                    .with_finished_markers(config.channel.consumer_concurrency),
            );
            let channel = create_channel(&config.channel, ack_callback);
            let progress = Arc::new(JobItemProgress::new());

            for consumer in channel.consumers()? {
                pairs.push(ChannelProgressPair::new(consumer, progress.clone()));
            }

            let dumper = dumper_factory(&DumperContext {
                task_id: task_id.clone(),
                task_index,
                resume_from: resume_from.clone(),
            })?;
            info!(
                job_id = %job_id,
                task_id = %task_id,
                resume_from = ?resume_from,
                "Task prepared"
            );

            tasks.push(JobTask {
                task_id: task_id.clone(),
                channel,
                progress,
                dumper: Some(dumper),
            });
        }

        let importers: Vec<Arc<Importer>> = if config.importer.sorted {
            vec![Arc::new(Importer::new(
                pairs,
                sink,
                rate_limit,
                config.importer.clone(),
            ))]
        } else {
            pairs
                .into_iter()
                .map(|pair| {
                    Arc::new(Importer::new(
                        vec![pair],
                        sink.clone(),
                        rate_limit.clone(),
                        config.importer.clone(),
                    ))
                })
                .collect()
        };

        let shutdown = Arc::new(Shutdown {
            stop: AtomicBool::new(false),
            importers: importers.clone(),
            producers: tasks.iter().map(|task| task.channel.producer()).collect(),
        });

        info!(
            job_id = %job_id,
            tasks = tasks.len(),
            importers = importers.len(),
            sorted = config.importer.sorted,
            "Job prepared"
        );

        Ok(Self {
            job_id,
            tasks,
            importers,
            repository,
            shutdown,
            errors: Arc::new(Mutex::new(Vec::new())),
            handles: Vec::new(),
            started_at: None,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn importers(&self) -> &[Arc<Importer>] {
        &self.importers
    }

    pub fn ack_handle(&self) -> JobAckHandle {
        JobAckHandle {
            importers: Arc::new(
                self.importers
                    .iter()
                    .map(|importer| (importer.id(), importer.clone()))
                    .collect(),
            ),
        }
    }

    pub fn stop_handle(&self) -> JobStopHandle {
        JobStopHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Spawn one thread per dumper and per importer.
    pub fn start(&mut self) -> Result<()> {
        if self.started_at.is_some() {
            warn!(job_id = %self.job_id, "Job already started");
            return Ok(());
        }
        self.started_at = Some((Utc::now(), Instant::now()));

        for task in &mut self.tasks {
            let Some(mut dumper) = task.dumper.take() else {
                continue;
            };
            let producer = task.channel.producer();
            let shutdown = self.shutdown.clone();
            let errors = self.errors.clone();
            let task_id = task.task_id.clone();

            let handle = thread::Builder::new()
                .name(format!("dumper-{}", task.task_id))
                .spawn(move || {
                    if let Err(e) = dumper.dump(producer.as_ref(), &shutdown.stop) {
                        error!(task_id = %task_id, error = %e, "Dumper failed, stopping job");
                        errors.lock().push(format!("dumper {}: {}", task_id, e));
                        shutdown.trigger();
                    }
                })?;
            self.handles.push(handle);
        }

        for (index, importer) in self.importers.iter().enumerate() {
            let importer = importer.clone();
            let shutdown = self.shutdown.clone();
            let errors = self.errors.clone();

            let handle = thread::Builder::new()
                .name(format!("importer-{}", index))
                .spawn(move || {
                    if let Err(e) = importer.run() {
                        errors.lock().push(format!("importer {}: {}", importer.id(), e));
                        shutdown.trigger();
                    }
                })?;
            self.handles.push(handle);
        }

        info!(job_id = %self.job_id, threads = self.handles.len(), "Job started");
        Ok(())
    }

    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Join every thread and report. Returns once all importers are done.
    pub fn wait(mut self) -> Result<JobReport> {
        let (started_at, started) = self
            .started_at
            .ok_or_else(|| PipelineError::Config("job was never started".to_string()))?;

        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(job_id = %self.job_id, thread = %name, "Worker thread panicked");
                self.errors.lock().push(format!("{} panicked", name));
                self.shutdown.trigger();
            }
        }

        let errors = self.errors.lock().clone();
        let status = if !errors.is_empty() {
            JobStatus::Failed
        } else if self.shutdown.is_triggered() {
            JobStatus::Stopped
        } else {
            JobStatus::Completed
        };

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            tasks.push(TaskReport {
                task_id: task.task_id.clone(),
                progress: task.progress.snapshot(),
                position: self.repository.load(&task.task_id)?,
            });
        }

        let report = JobReport {
            job_id: self.job_id.clone(),
            status,
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
            tasks,
            errors,
        };
        info!(
            job_id = %report.job_id,
            status = report.status.as_str(),
            processed_records = report.processed_records(),
            elapsed_ms = report.elapsed_ms,
            "Job ended"
        );
        Ok(report)
    }
}
