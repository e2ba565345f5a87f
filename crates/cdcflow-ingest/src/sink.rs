//! Sinks
//!
//! A sink applies written batches to the target. Delivery is at-least-once, so a sink
//! must tolerate batches that overlap what it has already applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use cdcflow_common::{DataRecord, DataRecordType, PipelineError, Record, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::importer::AckId;

/// Write target of an importer
pub trait PipelineSink: Send + Sync {
    /// Apply `records`, returning how many of them actually changed the target.
    ///
    /// Position heartbeats and finished markers are never counted.
    fn write(&self, ack_id: &AckId, records: &[Record]) -> Result<usize>;
}

/// Row image: column name to value
pub type Row = BTreeMap<String, Value>;

/// A batch as it reached [`MemorySink::write`]
#[derive(Debug, Clone)]
pub struct WrittenBatch {
    pub ack_id: AckId,
    pub records: Vec<Record>,
    pub applied: usize,
}

/// Idempotent in-memory target.
///
/// Rows are keyed by table and unique key values. Inserts and updates upsert the
/// after-image, deletes remove the row, and a change that leaves the row as it already
/// is counts as not applied.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<HashMap<String, BTreeMap<String, Row>>>,
    batches: Mutex<Vec<WrittenBatch>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until switched off again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Rows of `table`, ordered by key
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Rows across all tables
    pub fn row_count(&self) -> usize {
        self.tables.lock().values().map(BTreeMap::len).sum()
    }

    /// Every successful write, in call order
    pub fn written_batches(&self) -> Vec<WrittenBatch> {
        self.batches.lock().clone()
    }

    /// Ack ids of the successful writes from index `from` on, in call order
    pub fn ack_ids_since(&self, from: usize) -> Vec<AckId> {
        self.batches
            .lock()
            .iter()
            .skip(from)
            .map(|batch| batch.ack_id)
            .collect()
    }

    fn apply(tables: &mut HashMap<String, BTreeMap<String, Row>>, record: &DataRecord) -> bool {
        let rows = tables.entry(record.table_name.clone()).or_default();
        let key = row_key(record.unique_key_values());

        match record.operation {
            DataRecordType::Delete => rows.remove(&key).is_some(),
            DataRecordType::Insert | DataRecordType::Update => {
                let mut moved = false;
                if record.operation == DataRecordType::Update {
                    let before = before_key(record);
                    if before != key {
                        moved = rows.remove(&before).is_some();
                    }
                }

                let mut row = rows.get(&key).cloned().unwrap_or_default();
                for column in &record.columns {
                    if let Some(value) = column.value.as_ref() {
                        row.insert(column.name.clone(), value.clone());
                    }
                }

                if rows.get(&key) == Some(&row) && !moved {
                    return false;
                }
                rows.insert(key, row);
                true
            },
        }
    }
}

fn row_key(values: Vec<&Value>) -> String {
    Value::Array(values.into_iter().cloned().collect()).to_string()
}

/// Key of the row before an update, which differs from the after key when the update
/// changed a unique-key column.
fn before_key(record: &DataRecord) -> String {
    row_key(
        record
            .columns
            .iter()
            .filter(|column| column.unique_key)
            .map(|column| {
                column
                    .old_value
                    .as_ref()
                    .or(column.value.as_ref())
                    .unwrap_or(&Value::Null)
            })
            .collect(),
    )
}

impl PipelineSink for MemorySink {
    fn write(&self, ack_id: &AckId, records: &[Record]) -> Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PipelineError::SinkWrite(format!(
                "memory sink rejected batch {}",
                ack_id
            )));
        }

        let applied = {
            let mut tables = self.tables.lock();
            records
                .iter()
                .filter_map(Record::as_data)
                .filter(|record| Self::apply(&mut tables, record))
                .count()
        };
        trace!(ack_id = %ack_id, records = records.len(), applied, "Memory sink write");

        self.batches.lock().push(WrittenBatch {
            ack_id: *ack_id,
            records: records.to_vec(),
            applied,
        });
        Ok(applied)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cdcflow_common::{Column, FinishedRecord, IngestPosition, PlaceholderRecord};
    use serde_json::json;
    use uuid::Uuid;

    fn ack_id(sequence: u64) -> AckId {
        AckId::new(Uuid::nil(), sequence)
    }

    fn change(operation: DataRecordType, id: i64, name: &str) -> Record {
        DataRecord::new(operation, "t_user", IngestPosition::log("", id as u64))
            .with_column(Column::key("id", id))
            .with_column(Column::value("name", name))
            .into()
    }

    #[test]
    fn test_upsert_and_delete() {
        let sink = MemorySink::new();
        let applied = sink
            .write(
                &ack_id(1),
                &[
                    change(DataRecordType::Insert, 1, "a"),
                    change(DataRecordType::Insert, 2, "b"),
                    change(DataRecordType::Update, 1, "c"),
                    change(DataRecordType::Delete, 2, "b"),
                    PlaceholderRecord::new(IngestPosition::log("", 9)).into(),
                ],
            )
            .unwrap();

        assert_eq!(applied, 4);
        assert_eq!(sink.row_count(), 1);
        assert_eq!(sink.rows("t_user")[0]["name"], json!("c"));
    }

    #[test]
    fn test_replay_converges_and_skips_noop_changes() {
        let sink = MemorySink::new();
        let batch = vec![
            change(DataRecordType::Insert, 1, "a"),
            change(DataRecordType::Update, 1, "b"),
            change(DataRecordType::Insert, 2, "x"),
            change(DataRecordType::Delete, 2, "x"),
            FinishedRecord::new(IngestPosition::Finished).into(),
        ];

        assert_eq!(sink.write(&ack_id(1), &batch).unwrap(), 4);
        let state = sink.rows("t_user");

        // A full replay passes through intermediate states but ends where it started.
        sink.write(&ack_id(2), &batch).unwrap();
        assert_eq!(sink.rows("t_user"), state);

        // Re-applying a change that is already in place is not counted.
        assert_eq!(sink.write(&ack_id(3), &batch[1..2]).unwrap(), 0);
        assert_eq!(sink.rows("t_user"), state);
    }

    #[test]
    fn test_update_moving_the_key_removes_old_row() {
        let sink = MemorySink::new();
        sink.write(&ack_id(1), &[change(DataRecordType::Insert, 1, "a")])
            .unwrap();

        let moved: Record = DataRecord::new(DataRecordType::Update, "t_user", IngestPosition::log("", 2))
            .with_column(Column::key("id", 7).with_old_value(1))
            .with_column(Column::value("name", "a"))
            .into();
        assert_eq!(sink.write(&ack_id(2), &[moved]).unwrap(), 1);

        let rows = sink.rows("t_user");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(7));
    }

    #[test]
    fn test_failing_sink_records_nothing() {
        let sink = MemorySink::new();
        sink.set_failing(true);

        let err = sink
            .write(&ack_id(1), &[change(DataRecordType::Insert, 1, "a")])
            .unwrap_err();
        assert!(matches!(err, PipelineError::SinkWrite(_)));
        assert_eq!(sink.row_count(), 0);
        assert!(sink.written_batches().is_empty());

        sink.set_failing(false);
        assert_eq!(
            sink.write(&ack_id(2), &[change(DataRecordType::Insert, 1, "a")])
                .unwrap(),
            1
        );
        assert_eq!(sink.written_batches()[0].ack_id, ack_id(2));
    }
}
