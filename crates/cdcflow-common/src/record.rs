//! Records flowing through the pipeline
//!
//! Dumpers emit batches of [`Record`]s; channels buffer them; importers hand them to a
//! sink. The set of record kinds is closed:
//!
//! - [`DataRecord`]: one captured row change
//! - [`PlaceholderRecord`]: a position heartbeat without row data
//! - [`FinishedRecord`]: the terminal marker of a dumper's stream
//!
//! Every record carries the [`IngestPosition`] needed to resume capture after it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::position::IngestPosition;

/// Seed of the row routing hash.
///
/// Bump this (and document the bump) if the hash input ever changes: records already
/// buffered or replayed after a restart must route to the same sub-channel as before.
pub const ROUTING_HASH_SEED: u64 = 1;

const KEY_SEPARATOR: u8 = 0x1f;

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataRecordType {
    Insert,
    Update,
    Delete,
}

impl DataRecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataRecordType::Insert => "INSERT",
            DataRecordType::Update => "UPDATE",
            DataRecordType::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for DataRecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A column value of a captured row, with optional before-image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,

    /// Value before the change (updates and deletes)
    pub old_value: Option<Value>,

    /// Value after the change (inserts and updates)
    pub value: Option<Value>,

    /// Whether the change touched this column
    pub updated: bool,

    /// Whether this column is part of the row's unique key
    pub unique_key: bool,
}

impl Column {
    pub fn new(
        name: impl Into<String>,
        old_value: Option<Value>,
        value: Option<Value>,
        updated: bool,
        unique_key: bool,
    ) -> Self {
        Self {
            name: name.into(),
            old_value,
            value,
            updated,
            unique_key,
        }
    }

    /// Unique-key column carrying an after-image
    pub fn key(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(name, None, Some(value.into()), true, true)
    }

    /// Plain column carrying an after-image
    pub fn value(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(name, None, Some(value.into()), true, false)
    }

    pub fn with_old_value(mut self, old_value: impl Into<Value>) -> Self {
        self.old_value = Some(old_value.into());
        self
    }

    /// Value identifying the row: the after-image, or the before-image for deletes.
    ///
    /// An update that changes a key is identified by its new key, so it shares an
    /// identity with later changes of the row, not with earlier ones.
    pub fn identity_value(&self) -> Option<&Value> {
        self.value.as_ref().or(self.old_value.as_ref())
    }
}

/// A captured row-level change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub operation: DataRecordType,

    /// Logical table name
    pub table_name: String,

    pub position: IngestPosition,

    pub columns: Vec<Column>,

    /// Commit sequence number, set by sources that only expose a global commit order
    pub csn: Option<u64>,

    pub commit_time: Option<DateTime<Utc>>,
}

impl DataRecord {
    pub fn new(
        operation: DataRecordType,
        table_name: impl Into<String>,
        position: IngestPosition,
    ) -> Self {
        Self {
            operation,
            table_name: table_name.into(),
            position,
            columns: Vec::new(),
            csn: None,
            commit_time: None,
        }
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_csn(mut self, csn: u64) -> Self {
        self.csn = Some(csn);
        self
    }

    pub fn with_commit_time(mut self, commit_time: DateTime<Utc>) -> Self {
        self.commit_time = Some(commit_time);
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Values of the unique-key columns, in column order.
    ///
    /// A key column with neither image contributes `Value::Null`.
    pub fn unique_key_values(&self) -> Vec<&Value> {
        self.columns
            .iter()
            .filter(|column| column.unique_key)
            .map(|column| column.identity_value().unwrap_or(&Value::Null))
            .collect()
    }

    /// Stable hash of the row identity (table name + unique key values).
    ///
    /// All changes of one row hash identically, which is what keeps them on one
    /// sub-channel of a multiplexed channel. The exception is an update that changes
    /// the key: it hashes like the new key, so it can land apart from the old key's
    /// earlier changes.
    pub fn routing_hash(&self) -> u64 {
        let mut buf = Vec::with_capacity(self.table_name.len() + 16);
        buf.extend_from_slice(self.table_name.as_bytes());
        for value in self.unique_key_values() {
            buf.push(KEY_SEPARATOR);
            buf.extend_from_slice(value.to_string().as_bytes());
        }
        xxh3_64_with_seed(&buf, ROUTING_HASH_SEED)
    }
}

/// Position heartbeat without row data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderRecord {
    pub position: IngestPosition,
}

impl PlaceholderRecord {
    pub fn new(position: IngestPosition) -> Self {
        Self { position }
    }
}

/// Terminal marker: the dumper has no more data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedRecord {
    pub position: IngestPosition,
}

impl FinishedRecord {
    pub fn new(position: IngestPosition) -> Self {
        Self { position }
    }
}

/// Any record that can travel through a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Data(DataRecord),
    Placeholder(PlaceholderRecord),
    Finished(FinishedRecord),
}

impl Record {
    pub fn position(&self) -> &IngestPosition {
        match self {
            Record::Data(record) => &record.position,
            Record::Placeholder(record) => &record.position,
            Record::Finished(record) => &record.position,
        }
    }

    /// Commit sequence number; only data records carry one.
    pub fn csn(&self) -> Option<u64> {
        match self {
            Record::Data(record) => record.csn,
            Record::Placeholder(_) | Record::Finished(_) => None,
        }
    }

    pub fn as_data(&self) -> Option<&DataRecord> {
        match self {
            Record::Data(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Record::Data(_))
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Record::Finished(_))
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Record::Data(record) if record.operation == DataRecordType::Insert)
    }
}

impl From<DataRecord> for Record {
    fn from(record: DataRecord) -> Self {
        Record::Data(record)
    }
}

impl From<PlaceholderRecord> for Record {
    fn from(record: PlaceholderRecord) -> Self {
        Record::Placeholder(record)
    }
}

impl From<FinishedRecord> for Record {
    fn from(record: FinishedRecord) -> Self {
        Record::Finished(record)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn update(table: &str, id: i64, offset: u64) -> DataRecord {
        DataRecord::new(DataRecordType::Update, table, IngestPosition::log("", offset))
            .with_column(Column::key("id", id))
            .with_column(Column::value("name", format!("v{}", offset)).with_old_value("old"))
    }

    #[test]
    fn test_same_row_hashes_identically() {
        let first = update("t_order", 7, 1);
        let second = update("t_order", 7, 2);
        assert_eq!(first.routing_hash(), second.routing_hash());
    }

    #[test]
    fn test_hash_depends_on_table_and_key() {
        let base = update("t_order", 7, 1);
        assert_ne!(base.routing_hash(), update("t_order", 8, 1).routing_hash());
        assert_ne!(base.routing_hash(), update("t_order_item", 7, 1).routing_hash());
    }

    #[test]
    fn test_delete_uses_before_image_for_identity() {
        let delete = DataRecord::new(DataRecordType::Delete, "t_order", IngestPosition::log("", 3))
            .with_column(Column::new("id", Some(json!(7)), None, false, true));
        assert_eq!(delete.unique_key_values(), vec![&json!(7)]);
        assert_eq!(delete.routing_hash(), update("t_order", 7, 1).routing_hash());
    }

    #[test]
    fn test_key_change_hashes_like_the_new_key() {
        let moved = DataRecord::new(DataRecordType::Update, "t_order", IngestPosition::log("", 4))
            .with_column(Column::key("id", 8).with_old_value(7));
        assert_eq!(moved.unique_key_values(), vec![&json!(8)]);
        assert_eq!(moved.routing_hash(), update("t_order", 8, 1).routing_hash());
        assert_ne!(moved.routing_hash(), update("t_order", 7, 1).routing_hash());
    }

    #[test]
    fn test_composite_key_keeps_column_order() {
        let record = DataRecord::new(DataRecordType::Insert, "t", IngestPosition::Placeholder)
            .with_column(Column::key("a", 1))
            .with_column(Column::value("x", "ignored"))
            .with_column(Column::key("b", "z"));
        assert_eq!(record.unique_key_values(), vec![&json!(1), &json!("z")]);
    }

    #[test]
    fn test_record_accessors() {
        let data: Record = update("t", 1, 5).with_csn(11).into();
        assert_eq!(data.csn(), Some(11));
        assert!(data.is_data());
        assert!(!data.is_insert());

        let finished: Record = FinishedRecord::new(IngestPosition::Finished).into();
        assert!(finished.is_finished());
        assert_eq!(finished.csn(), None);
        assert_eq!(finished.position(), &IngestPosition::Finished);

        let placeholder: Record = PlaceholderRecord::new(IngestPosition::log("", 9)).into();
        assert_eq!(placeholder.position(), &IngestPosition::log("", 9));
        assert!(placeholder.as_data().is_none());
    }

    proptest! {
        #[test]
        fn prop_hash_ignores_non_key_columns(
            id in any::<i64>(),
            first in ".*",
            second in ".*",
            offset in any::<u64>(),
        ) {
            let a = DataRecord::new(DataRecordType::Update, "t", IngestPosition::log("", 1))
                .with_column(Column::key("id", id))
                .with_column(Column::value("name", first));
            let b = DataRecord::new(DataRecordType::Delete, "t", IngestPosition::log("", offset))
                .with_column(Column::new("id", Some(json!(id)), None, false, true))
                .with_column(Column::value("name", second));
            prop_assert_eq!(a.routing_hash(), b.routing_hash());
        }
    }

    #[test]
    fn test_operation_display() {
        assert_eq!(DataRecordType::Insert.to_string(), "INSERT");
        assert_eq!(
            serde_json::to_value(DataRecordType::Delete).unwrap(),
            json!("DELETE")
        );
    }
}
