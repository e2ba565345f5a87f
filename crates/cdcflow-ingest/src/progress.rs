//! Progress tracking
//!
//! The importer reports, after every sink write, how many records the sink actually
//! applied. Replayed batches that the sink skips therefore do not inflate throughput.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Receives applied-record counts from the importer
pub trait ProgressListener: Send + Sync {
    fn on_progress_update(&self, applied_count: usize);
}

impl<F> ProgressListener for F
where
    F: Fn(usize) + Send + Sync,
{
    fn on_progress_update(&self, applied_count: usize) {
        self(applied_count)
    }
}

/// Progress of one job item (task)
#[derive(Debug, Default)]
pub struct JobItemProgress {
    processed_records: AtomicU64,
    updates: AtomicU64,
    last_update: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time view of a [`JobItemProgress`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub processed_records: u64,
    pub updates: u64,
    pub last_update: Option<DateTime<Utc>>,
}

impl JobItemProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed_records(&self) -> u64 {
        self.processed_records.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            processed_records: self.processed_records.load(Ordering::Acquire),
            updates: self.updates.load(Ordering::Acquire),
            last_update: *self.last_update.lock(),
        }
    }
}

impl ProgressListener for JobItemProgress {
    fn on_progress_update(&self, applied_count: usize) {
        self.processed_records
            .fetch_add(applied_count as u64, Ordering::AcqRel);
        self.updates.fetch_add(1, Ordering::AcqRel);
        *self.last_update.lock() = Some(Utc::now());
    }
}
