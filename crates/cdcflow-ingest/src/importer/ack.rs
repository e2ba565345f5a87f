//! Ack ids and pending acknowledgements

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use cdcflow_common::{PipelineError, Record, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one batch written by one importer.
///
/// Sequences are strictly increasing per importer, so acknowledging an id also covers
/// every earlier batch of the same importer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AckId {
    pub importer: Uuid,
    pub sequence: u64,
}

impl AckId {
    pub fn new(importer: Uuid, sequence: u64) -> Self {
        Self { importer, sequence }
    }
}

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.importer, self.sequence)
    }
}

impl FromStr for AckId {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || PipelineError::UnknownAckId(s.to_string());
        let (importer, sequence) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            importer: Uuid::parse_str(importer).map_err(|_| invalid())?,
            sequence: sequence.parse().map_err(|_| invalid())?,
        })
    }
}

/// When written batches are acknowledged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Right after the sink write returns
    #[default]
    Immediate,
    /// When the sink owner calls [`Importer::ack`](super::Importer::ack)
    Deferred,
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "immediate" => Ok(AckMode::Immediate),
            "deferred" => Ok(AckMode::Deferred),
            _ => Err(format!("Invalid ack mode: {}", s)),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::Immediate => write!(f, "immediate"),
            AckMode::Deferred => write!(f, "deferred"),
        }
    }
}

/// A written batch waiting for its acknowledgement
#[derive(Debug)]
pub(crate) struct PendingAck {
    pub pair_index: usize,
    pub records: Vec<Record>,
}

/// Written-but-unacknowledged batches of one importer, by sequence
#[derive(Debug, Default)]
pub(crate) struct PendingAcks {
    batches: BTreeMap<u64, PendingAck>,
}

impl PendingAcks {
    pub fn insert(&mut self, sequence: u64, pending: PendingAck) {
        self.batches.insert(sequence, pending);
    }

    /// Acknowledge every batch with a sequence up to and including `sequence`, oldest
    /// first. A batch leaves the map only once `ack` succeeded for it, so a failure
    /// keeps it and every later batch pending for the next attempt.
    pub fn ack_through<F>(&mut self, sequence: u64, mut ack: F) -> Result<usize>
    where
        F: FnMut(&PendingAck) -> Result<()>,
    {
        let mut acked = 0;
        while let Some(entry) = self.batches.first_entry() {
            if *entry.key() > sequence {
                break;
            }
            ack(entry.get())?;
            entry.remove();
            acked += 1;
        }
        Ok(acked)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
