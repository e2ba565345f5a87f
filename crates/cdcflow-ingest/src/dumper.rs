//! Dumpers
//!
//! A dumper captures changes from a source and pushes them to its task's channel. It
//! must push exactly one [`FinishedRecord`] once capture is complete, and must set a
//! csn on every data record when the source orders commits globally.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cdcflow_common::{
    Column, DataRecord, DataRecordType, FinishedRecord, IngestPosition, PlaceholderRecord,
    Record, Result,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::channel::ChannelProducer;
use crate::ratelimit::{JobRateLimitAlgorithm, PipelineOperationType};

/// Source side of a task
pub trait Dumper: Send {
    /// Capture until the source is exhausted or `stop` is set.
    fn dump(&mut self, channel: &dyn ChannelProducer, stop: &AtomicBool) -> Result<()>;
}

/// Global commit sequence shared by the dumpers of one job
#[derive(Debug, Default)]
pub struct CsnSequence {
    last: AtomicU64,
}

impl CsnSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }
}

pub const DEFAULT_SYNTHETIC_BATCH_SIZE: usize = 100;
pub const DEFAULT_PLACEHOLDER_INTERVAL: u64 = 500;

/// Shape of a synthetic change stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticSource {
    pub tables: Vec<String>,
    pub keys_per_table: u64,
    /// Data records in the stream, not counting heartbeats and the finished marker
    pub records: u64,
    /// Records per push; one push is one transaction
    pub batch_size: usize,
    /// A heartbeat follows every this many data records; zero disables heartbeats
    pub placeholder_interval: u64,
}

impl SyntheticSource {
    pub fn new(tables: Vec<String>, keys_per_table: u64, records: u64) -> Self {
        Self {
            tables,
            keys_per_table,
            records,
            batch_size: DEFAULT_SYNTHETIC_BATCH_SIZE,
            placeholder_interval: DEFAULT_PLACEHOLDER_INTERVAL,
        }
    }

    /// The data record at log `offset` (1-based). The first `tables * keys` offsets
    /// insert every row once; later offsets mostly update and occasionally delete or
    /// re-insert.
    pub fn record_at(&self, offset: u64) -> DataRecord {
        let table_count = self.tables.len().max(1) as u64;
        let keys = self.keys_per_table.max(1);
        let index = offset - 1;
        let table = &self.tables[(index % table_count) as usize];
        let key = (index / table_count) % keys + 1;

        let operation = if index < table_count * keys {
            DataRecordType::Insert
        } else {
            match xxh3_64(&offset.to_le_bytes()) % 10 {
                0 => DataRecordType::Delete,
                1 => DataRecordType::Insert,
                _ => DataRecordType::Update,
            }
        };

        let record = DataRecord::new(operation, table.as_str(), IngestPosition::log("", offset))
            .with_column(Column::key("id", key))
            .with_column(Column::value("version", offset))
            .with_commit_time(Utc::now());
        match operation {
            DataRecordType::Delete => record.with_column(Column::new(
                "status",
                Some("deleted".into()),
                None,
                true,
                false,
            )),
            _ => record.with_column(Column::value("status", "active")),
        }
    }
}

/// Deterministic change stream for one task
pub struct SyntheticDumper {
    task_id: String,
    source: SyntheticSource,
    resume_from: Option<IngestPosition>,
    csn: Option<Arc<CsnSequence>>,
    rate_limit: Option<Arc<dyn JobRateLimitAlgorithm>>,
}

impl SyntheticDumper {
    pub fn new(task_id: impl Into<String>, source: SyntheticSource) -> Self {
        Self {
            task_id: task_id.into(),
            source,
            resume_from: None,
            csn: None,
            rate_limit: None,
        }
    }

    /// Skip everything up to and including a previously acknowledged position.
    pub fn resume_from(mut self, position: Option<IngestPosition>) -> Self {
        self.resume_from = position;
        self
    }

    /// Stamp every transaction with the next csn of `sequence`.
    pub fn with_csn(mut self, sequence: Arc<CsnSequence>) -> Self {
        self.csn = Some(sequence);
        self
    }

    /// Throttle source reads, one select per transaction
    pub fn with_rate_limit(mut self, rate_limit: Option<Arc<dyn JobRateLimitAlgorithm>>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    fn start_offset(&self) -> Option<u64> {
        match &self.resume_from {
            None | Some(IngestPosition::Placeholder) => Some(1),
            Some(IngestPosition::Log { offset, .. }) => Some(offset + 1),
            Some(IngestPosition::Finished) => None,
            Some(other) => {
                debug!(task_id = %self.task_id, position = %other, "Unusable resume position, starting over");
                Some(1)
            },
        }
    }

    /// Push one batch. `Ok(false)` means the job is stopping and capture should end.
    fn push(&self, channel: &dyn ChannelProducer, stop: &AtomicBool, records: Vec<Record>) -> Result<bool> {
        if stop.load(Ordering::Acquire) {
            return Ok(false);
        }
        match channel.push_records(records) {
            Ok(()) => Ok(true),
            Err(e) if e.is_cancellation() && stop.load(Ordering::Acquire) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Dumper for SyntheticDumper {
    fn dump(&mut self, channel: &dyn ChannelProducer, stop: &AtomicBool) -> Result<()> {
        let Some(start) = self.start_offset() else {
            info!(task_id = %self.task_id, "Task already finished, emitting finished marker");
            self.push(channel, stop, vec![FinishedRecord::new(IngestPosition::Finished).into()])?;
            return Ok(());
        };

        info!(
            task_id = %self.task_id,
            start_offset = start,
            records = self.source.records,
            sorted = self.csn.is_some(),
            "Dump started"
        );

        let batch_size = self.source.batch_size.max(1) as u64;
        let mut offset = start;
        let mut since_heartbeat = 0u64;

        while offset <= self.source.records {
            let end = (offset + batch_size - 1).min(self.source.records);
            if let Some(rate_limit) = &self.rate_limit {
                rate_limit.intercept(PipelineOperationType::Select, 1);
            }

            let csn = self.csn.as_ref().map(|sequence| sequence.next());
            let batch: Vec<Record> = (offset..=end)
                .map(|offset| {
                    let record = self.source.record_at(offset);
                    match csn {
                        Some(csn) => record.with_csn(csn).into(),
                        None => record.into(),
                    }
                })
                .collect();

            if !self.push(channel, stop, batch)? {
                info!(task_id = %self.task_id, offset, "Dump stopped");
                return Ok(());
            }

            since_heartbeat += end - offset + 1;
            let interval = self.source.placeholder_interval;
            if interval > 0 && since_heartbeat >= interval {
                since_heartbeat = 0;
                let heartbeat = PlaceholderRecord::new(IngestPosition::log("", end));
                if !self.push(channel, stop, vec![heartbeat.into()])? {
                    return Ok(());
                }
            }

            offset = end + 1;
        }

        if self.push(channel, stop, vec![FinishedRecord::new(IngestPosition::Finished).into()])? {
            info!(task_id = %self.task_id, last_offset = self.source.records, "Dump finished");
        }
        Ok(())
    }
}
