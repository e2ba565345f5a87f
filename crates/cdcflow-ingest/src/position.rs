//! Position persistence
//!
//! Acknowledged positions are what makes delivery at-least-once: a task resumes from
//! the last persisted position, so anything written but not yet acknowledged is
//! replayed after a restart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cdcflow_common::{IngestPosition, PipelineError, Record, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::channel::AckCallback;

/// Durable store of the latest acknowledged position per task
pub trait PositionRepository: Send + Sync {
    fn persist(&self, task_id: &str, position: &IngestPosition) -> Result<()>;

    fn load(&self, task_id: &str) -> Result<Option<IngestPosition>>;
}

/// In-memory repository, used by tests and by jobs that do not need to resume
#[derive(Debug, Default)]
pub struct MemoryPositionRepository {
    positions: Mutex<HashMap<String, IngestPosition>>,
}

impl MemoryPositionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionRepository for MemoryPositionRepository {
    fn persist(&self, task_id: &str, position: &IngestPosition) -> Result<()> {
        self.positions
            .lock()
            .insert(task_id.to_string(), position.clone());
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<Option<IngestPosition>> {
        Ok(self.positions.lock().get(task_id).cloned())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedPosition {
    task_id: String,
    position: IngestPosition,
    updated_at: DateTime<Utc>,
}

/// One JSON file per task under a directory.
///
/// Files are replaced through a temporary file and a rename, so a crash mid-write
/// leaves the previous position intact.
#[derive(Debug, Clone)]
pub struct JsonFilePositionRepository {
    dir: PathBuf,
}

impl JsonFilePositionRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        let file_name: String = task_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

impl PositionRepository for JsonFilePositionRepository {
    fn persist(&self, task_id: &str, position: &IngestPosition) -> Result<()> {
        let path = self.path_for(task_id);
        let tmp_path = path.with_extension("json.tmp");
        let persisted = PersistedPosition {
            task_id: task_id.to_string(),
            position: position.clone(),
            updated_at: Utc::now(),
        };

        fs::write(&tmp_path, serde_json::to_vec_pretty(&persisted)?)?;
        fs::rename(&tmp_path, &path)?;
        trace!(task_id, position = %position, path = %path.display(), "Position persisted");
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<Option<IngestPosition>> {
        let path = self.path_for(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let persisted: PersistedPosition = serde_json::from_slice(&fs::read(&path)?)?;
        Ok(Some(persisted.position))
    }
}

/// Ack callback persisting the position of the last acknowledged record of a task.
///
/// A multiplexed task receives one finished marker per sub-channel. `Finished` is only
/// persisted once all of them have been acknowledged, and nothing is persisted after
/// that.
pub struct PositionAckCallback {
    task_id: String,
    repository: Arc<dyn PositionRepository>,
    finished_markers: usize,
    finished_acked: AtomicUsize,
}

impl PositionAckCallback {
    pub fn new(task_id: impl Into<String>, repository: Arc<dyn PositionRepository>) -> Self {
        Self {
            task_id: task_id.into(),
            repository,
            finished_markers: 1,
            finished_acked: AtomicUsize::new(0),
        }
    }

    /// Number of finished markers that complete the task (the sub-channel count)
    pub fn with_finished_markers(mut self, count: usize) -> Self {
        self.finished_markers = count.max(1);
        self
    }

    fn persist(&self, position: &IngestPosition) -> Result<()> {
        self.repository
            .persist(&self.task_id, position)
            .map_err(|e| PipelineError::PositionPersistence {
                task: self.task_id.clone(),
                reason: e.to_string(),
            })?;
        debug!(task_id = %self.task_id, position = %position, "Ack persisted");
        Ok(())
    }
}

impl AckCallback for PositionAckCallback {
    fn on_ack(&self, records: &[Record]) -> Result<()> {
        if self.finished_acked.load(Ordering::Acquire) >= self.finished_markers {
            return Ok(());
        }

        let markers = records.iter().filter(|r| r.is_finished()).count();
        if markers > 0 {
            let acked = self.finished_acked.fetch_add(markers, Ordering::AcqRel) + markers;
            if acked >= self.finished_markers {
                return self.persist(&IngestPosition::Finished);
            }
        }

        match records.iter().rev().find(|r| !r.is_finished()) {
            Some(last) => self.persist(last.position()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cdcflow_common::{FinishedRecord, PlaceholderRecord};
    use tempfile::TempDir;

    struct FailingRepository;

    impl PositionRepository for FailingRepository {
        fn persist(&self, _task_id: &str, _position: &IngestPosition) -> Result<()> {
            Err(PipelineError::Io(std::io::Error::other("read-only")))
        }

        fn load(&self, _task_id: &str) -> Result<Option<IngestPosition>> {
            Ok(None)
        }
    }

    #[test]
    fn test_json_file_repository_roundtrip() {
        let dir = TempDir::new().unwrap();
        let repository = JsonFilePositionRepository::new(dir.path().join("positions")).unwrap();

        assert_eq!(repository.load("ds_0.t_order").unwrap(), None);

        repository
            .persist("ds_0.t_order", &IngestPosition::log("binlog.000002", 154))
            .unwrap();
        repository
            .persist("ds_0.t_order", &IngestPosition::log("binlog.000002", 980))
            .unwrap();

        assert_eq!(
            repository.load("ds_0.t_order").unwrap(),
            Some(IngestPosition::log("binlog.000002", 980))
        );
        assert!(repository.dir().join("ds_0_t_order.json").exists());
        assert!(!repository.dir().join("ds_0_t_order.json.tmp").exists());
    }

    #[test]
    fn test_ack_callback_persists_last_position() {
        let repository = Arc::new(MemoryPositionRepository::new());
        let callback = PositionAckCallback::new("task-1", repository.clone());

        callback.on_ack(&[]).unwrap();
        assert_eq!(repository.load("task-1").unwrap(), None);

        callback
            .on_ack(&[
                PlaceholderRecord::new(IngestPosition::log("", 3)).into(),
                FinishedRecord::new(IngestPosition::Finished).into(),
            ])
            .unwrap();
        assert_eq!(repository.load("task-1").unwrap(), Some(IngestPosition::Finished));
    }

    #[test]
    fn test_finished_waits_for_every_sub_channel_marker() {
        let repository = Arc::new(MemoryPositionRepository::new());
        let callback =
            PositionAckCallback::new("task-1", repository.clone()).with_finished_markers(2);
        let finished: Record = FinishedRecord::new(IngestPosition::Finished).into();

        callback
            .on_ack(&[
                PlaceholderRecord::new(IngestPosition::log("", 5)).into(),
                finished.clone(),
            ])
            .unwrap();
        assert_eq!(repository.load("task-1").unwrap(), Some(IngestPosition::log("", 5)));

        callback.on_ack(&[finished]).unwrap();
        assert_eq!(repository.load("task-1").unwrap(), Some(IngestPosition::Finished));

        // A late ack from a slower sub-channel does not move the task backwards.
        callback
            .on_ack(&[PlaceholderRecord::new(IngestPosition::log("", 4)).into()])
            .unwrap();
        assert_eq!(repository.load("task-1").unwrap(), Some(IngestPosition::Finished));
    }

    #[test]
    fn test_ack_callback_reports_persistence_failure() {
        let callback = PositionAckCallback::new("task-1", Arc::new(FailingRepository));
        let err = callback
            .on_ack(&[PlaceholderRecord::new(IngestPosition::log("", 1)).into()])
            .unwrap_err();
        assert!(matches!(err, PipelineError::PositionPersistence { ref task, .. } if task == "task-1"));
    }
}
