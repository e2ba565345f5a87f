//! Commit-sequence merge queue entries

use std::cmp::Ordering;

use cdcflow_common::Record;

/// One fetched batch waiting in the sorted importer's merge queue.
///
/// Entries compare by `csn` only; batches of different pairs with the same csn are
/// equal and leave the queue in no particular order.
#[derive(Debug)]
pub struct CsnRecords {
    pub csn: u64,
    pub pair_index: usize,
    pub records: Vec<Record>,
}

impl CsnRecords {
    /// Keyed on the first csn found in the batch. Batches with no csn at all carry no
    /// ordering obligation and are handed back.
    pub fn from_batch(pair_index: usize, records: Vec<Record>) -> Result<Self, Vec<Record>> {
        match records.iter().find_map(Record::csn) {
            Some(csn) => Ok(Self {
                csn,
                pair_index,
                records,
            }),
            None => Err(records),
        }
    }
}

impl PartialEq for CsnRecords {
    fn eq(&self, other: &Self) -> bool {
        self.csn == other.csn
    }
}

impl Eq for CsnRecords {}

impl PartialOrd for CsnRecords {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CsnRecords {
    fn cmp(&self, other: &Self) -> Ordering {
        self.csn.cmp(&other.csn)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cdcflow_common::{
        DataRecord, DataRecordType, FinishedRecord, IngestPosition, PlaceholderRecord,
    };
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    fn batch_with_csn(csn: u64) -> Vec<Record> {
        vec![DataRecord::new(DataRecordType::Insert, "t", IngestPosition::log("", csn))
            .with_csn(csn)
            .into()]
    }

    #[test]
    fn test_queue_polls_in_ascending_csn() {
        let mut queue = BinaryHeap::new();
        for (pair_index, csn) in [(0, 3), (1, 1), (2, 2)] {
            queue.push(Reverse(CsnRecords::from_batch(pair_index, batch_with_csn(csn)).unwrap()));
        }

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop().map(|Reverse(e)| e.csn)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_batches_without_csn_are_returned() {
        let records: Vec<Record> = vec![
            PlaceholderRecord::new(IngestPosition::log("", 1)).into(),
            FinishedRecord::new(IngestPosition::Finished).into(),
        ];
        let returned = CsnRecords::from_batch(0, records).unwrap_err();
        assert_eq!(returned.len(), 2);
    }

    #[test]
    fn test_keyed_on_first_csn_in_batch() {
        let mut records: Vec<Record> =
            vec![PlaceholderRecord::new(IngestPosition::log("", 1)).into()];
        records.extend(batch_with_csn(9));
        records.extend(batch_with_csn(4));

        let entry = CsnRecords::from_batch(1, records).unwrap();
        assert_eq!(entry.csn, 9);
        assert_eq!(entry.records.len(), 3);
    }
}
