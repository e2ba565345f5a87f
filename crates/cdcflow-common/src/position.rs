//! Ingest positions
//!
//! An [`IngestPosition`] is the resumable cursor a dumper attaches to every record it
//! emits. The pipeline never orders positions itself; it only hands the position of the
//! last acknowledged record to the ack callback, which persists it so capture can resume
//! after a crash.

use serde::{Deserialize, Serialize};

/// Bound of a unique-key range used by inventory (snapshot) positions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyBound {
    Integer(i64),
    Text(String),
}

impl std::fmt::Display for KeyBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyBound::Integer(value) => write!(f, "{}", value),
            KeyBound::Text(value) => write!(f, "{}", value),
        }
    }
}

/// Opaque, source-specific resume cursor.
///
/// Positions are not `Ord`: only the source adapter that produced a
/// position knows how to compare it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestPosition {
    /// The task has dumped everything it owns.
    Finished,

    /// No concrete position yet.
    Placeholder,

    /// Inventory range over a unique key. Missing bounds are open.
    PrimaryKey {
        begin: Option<KeyBound>,
        end: Option<KeyBound>,
    },

    /// Binlog-style position. `file` is empty for single-stream logs.
    Log { file: String, offset: u64 },

    /// WAL log sequence number.
    Lsn { lsn: u64 },
}

impl IngestPosition {
    pub fn log(file: impl Into<String>, offset: u64) -> Self {
        IngestPosition::Log {
            file: file.into(),
            offset,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, IngestPosition::Finished)
    }
}

impl std::fmt::Display for IngestPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestPosition::Finished => write!(f, "finished"),
            IngestPosition::Placeholder => write!(f, "placeholder"),
            IngestPosition::PrimaryKey { begin, end } => {
                let begin = begin.as_ref().map(ToString::to_string).unwrap_or_default();
                let end = end.as_ref().map(ToString::to_string).unwrap_or_default();
                write!(f, "pk[{},{}]", begin, end)
            },
            IngestPosition::Log { file, offset } if file.is_empty() => {
                write!(f, "log#{}", offset)
            },
            IngestPosition::Log { file, offset } => write!(f, "log:{}#{}", file, offset),
            IngestPosition::Lsn { lsn } => write!(f, "lsn:{:X}", lsn),
        }
    }
}
