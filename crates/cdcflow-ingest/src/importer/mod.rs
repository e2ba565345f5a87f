//! Importer
//!
//! Drains one or more channel/progress pairs into a sink. In unsorted mode each pair is
//! drained independently. In sorted mode the importer merges the pairs: it keeps the
//! head batch of every pair queued by csn, writes the lowest, and refills from that
//! pair before choosing again, so the sink sees a single commit timeline even when
//! capture was partitioned. A pair with nothing buffered does not hold the merge back;
//! a batch it receives later can carry a lower csn than one already written.
//!
//! Every write is preceded by a rate limit check, followed by a progress update with
//! the sink's applied count, and recorded as pending until acknowledged. A batch is
//! never acknowledged before its write succeeded. In deferred mode writes block while
//! `max_pending_acks` batches await acknowledgement, and a run that drained every
//! pair returns only once the last of them was acknowledged.

mod ack;
mod csn;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cdcflow_common::{PipelineError, Record, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::ChannelProgressPair;
use crate::config::ImporterConfig;
use crate::ratelimit::{JobRateLimitAlgorithm, PipelineOperationType};
use crate::sink::PipelineSink;

pub use ack::{AckId, AckMode};
pub use csn::CsnRecords;

use ack::{PendingAck, PendingAcks};

/// Bounds of the sorted importer's idle wait after an empty poll
const MIN_IDLE_WAIT: Duration = Duration::from_millis(1);
const MAX_IDLE_WAIT: Duration = Duration::from_millis(100);

/// How often a blocked writer re-checks for a stop request
const ACK_WAIT_INTERVAL: Duration = Duration::from_millis(50);

pub struct Importer {
    id: Uuid,
    pairs: Vec<ChannelProgressPair>,
    sink: Arc<dyn PipelineSink>,
    rate_limit: Option<Arc<dyn JobRateLimitAlgorithm>>,
    config: ImporterConfig,
    stopped: AtomicBool,
    sequence: AtomicU64,
    pending: Mutex<PendingAcks>,
    acked: Condvar,
}

impl Importer {
    pub fn new(
        pairs: Vec<ChannelProgressPair>,
        sink: Arc<dyn PipelineSink>,
        rate_limit: Option<Arc<dyn JobRateLimitAlgorithm>>,
        config: ImporterConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pairs,
            sink,
            rate_limit,
            config,
            stopped: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            pending: Mutex::new(PendingAcks::default()),
            acked: Condvar::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Drain the owned pairs until each delivered its finished marker or [`stop`] is
    /// called. Blocks the calling thread.
    ///
    /// A sink failure ends the run with the error; the failed batch is not acknowledged.
    /// In deferred mode a completed run also waits for every written batch to be
    /// acknowledged.
    ///
    /// [`stop`]: Importer::stop
    pub fn run(&self) -> Result<()> {
        info!(
            importer = %self.id,
            pairs = self.pairs.len(),
            sorted = self.config.sorted,
            ack_mode = %self.config.ack_mode,
            "Importer started"
        );

        let result = if self.config.sorted {
            self.run_sorted()
        } else {
            self.run_unsorted()
        };
        if result.is_ok() {
            self.await_pending_acks();
        }

        match &result {
            Ok(()) => info!(importer = %self.id, stopped = self.is_stopped(), "Importer finished"),
            Err(e) => error!(importer = %self.id, error = %e, "Importer failed"),
        }
        result
    }

    /// Ask the importer to exit at its next loop boundary. An in-flight write and its
    /// acknowledgement complete first.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!(importer = %self.id, "Importer stop requested");
        }
        self.acked.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Acknowledge every pending batch up to and including `ack_id`, oldest first.
    ///
    /// Returns the number of batches acknowledged. Ids that were already acknowledged
    /// are accepted and acknowledge nothing. If a channel ack fails, that batch and every
    /// later one stay pending, so the same id can be acknowledged again.
    pub fn ack(&self, ack_id: &AckId) -> Result<usize> {
        if ack_id.importer != self.id || ack_id.sequence >= self.sequence.load(Ordering::Acquire) {
            warn!(importer = %self.id, ack_id = %ack_id, "Rejected unknown ack id");
            return Err(PipelineError::UnknownAckId(ack_id.to_string()));
        }

        // Held across the channel acks so positions are persisted in sequence order.
        let mut pending = self.pending.lock();
        let result = pending.ack_through(ack_id.sequence, |batch| {
            self.pairs[batch.pair_index].channel().ack(&batch.records)
        });
        self.acked.notify_all();

        match result {
            Ok(count) => {
                if count > 0 {
                    debug!(importer = %self.id, ack_id = %ack_id, batches = count, "Acknowledged");
                }
                Ok(count)
            },
            Err(e) => {
                warn!(
                    importer = %self.id,
                    ack_id = %ack_id,
                    pending = pending.len(),
                    error = %e,
                    "Ack failed, batches stay pending"
                );
                Err(e)
            },
        }
    }

    /// Batches written but not yet acknowledged
    pub fn pending_ack_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn run_unsorted(&self) -> Result<()> {
        let batch_size = self.config.batch_size;
        let timeout = self.config.fetch_timeout_duration();
        let mut retired = vec![false; self.pairs.len()];

        while !self.is_stopped() && retired.iter().any(|done| !done) {
            for (index, pair) in self.pairs.iter().enumerate() {
                if retired[index] || self.is_stopped() {
                    continue;
                }

                let Some(records) = self.fetch(|| pair.channel().fetch_records(batch_size, timeout))?
                else {
                    return Ok(());
                };
                if records.is_empty() {
                    continue;
                }

                retired[index] = self.write(index, records)?;
            }
        }
        Ok(())
    }

    fn run_sorted(&self) -> Result<()> {
        let idle_wait = self.idle_wait();
        let mut retired = vec![false; self.pairs.len()];
        let mut queued = vec![false; self.pairs.len()];
        let mut queue: BinaryHeap<Reverse<CsnRecords>> = BinaryHeap::new();

        while !self.is_stopped() && retired.iter().any(|done| !done) {
            let Some(found) = self.fill_queue(&mut queue, &mut queued, &mut retired)? else {
                return Ok(());
            };

            match queue.pop() {
                Some(Reverse(entry)) => {
                    queued[entry.pair_index] = false;
                    retired[entry.pair_index] = self.write(entry.pair_index, entry.records)?;
                },
                None if !found => thread::sleep(idle_wait),
                None => {},
            }
        }
        Ok(())
    }

    /// Poll every live pair without a queued batch until it yields a batch with a csn or
    /// runs dry. Batches without a csn (placeholders, finished markers) are written on
    /// the spot.
    ///
    /// Returns whether anything was fetched, or `None` once the importer is stopping.
    fn fill_queue(
        &self,
        queue: &mut BinaryHeap<Reverse<CsnRecords>>,
        queued: &mut [bool],
        retired: &mut [bool],
    ) -> Result<Option<bool>> {
        let mut found = false;
        for (index, pair) in self.pairs.iter().enumerate() {
            while !retired[index] && !queued[index] && !self.is_stopped() {
                // A batch size of one with no wait takes exactly one whole buffered batch.
                let Some(records) =
                    self.fetch(|| pair.channel().fetch_records(1, Duration::ZERO))?
                else {
                    return Ok(None);
                };
                if records.is_empty() {
                    break;
                }
                found = true;

                match CsnRecords::from_batch(index, records) {
                    Ok(entry) => {
                        queue.push(Reverse(entry));
                        queued[index] = true;
                    },
                    Err(records) => retired[index] = self.write(index, records)?,
                }
            }
        }
        Ok(Some(found))
    }

    fn idle_wait(&self) -> Duration {
        self.config
            .fetch_timeout_duration()
            .clamp(MIN_IDLE_WAIT, MAX_IDLE_WAIT)
    }

    /// Block while the pending map is full. Returns false if the importer was stopped
    /// while waiting.
    fn wait_for_ack_room(&self) -> bool {
        let limit = self.config.max_pending_acks.max(1);
        let mut pending = self.pending.lock();
        if pending.len() >= limit {
            debug!(importer = %self.id, pending = pending.len(), "Waiting for acks before writing");
        }
        while pending.len() >= limit {
            if self.is_stopped() {
                return false;
            }
            self.acked.wait_for(&mut pending, ACK_WAIT_INTERVAL);
        }
        true
    }

    fn await_pending_acks(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() && !self.is_stopped() {
            info!(importer = %self.id, pending = pending.len(), "Waiting for pending acks");
        }
        while !pending.is_empty() && !self.is_stopped() {
            self.acked.wait_for(&mut pending, ACK_WAIT_INTERVAL);
        }
    }

    /// Run a fetch, turning a closed channel into `None` once the importer is stopping.
    fn fetch<F>(&self, fetch: F) -> Result<Option<Vec<Record>>>
    where
        F: FnOnce() -> Result<Vec<Record>>,
    {
        match fetch() {
            Ok(records) => Ok(Some(records)),
            Err(e) if e.is_cancellation() && self.is_stopped() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write one batch of the pair at `pair_index`. Returns whether the batch carried the
    /// pair's finished marker.
    ///
    /// A batch dropped because the importer stopped while waiting for ack room is never
    /// acknowledged, so capture replays it.
    fn write(&self, pair_index: usize, records: Vec<Record>) -> Result<bool> {
        let pair = &self.pairs[pair_index];
        if !self.wait_for_ack_room() {
            return Ok(false);
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.intercept(PipelineOperationType::Insert, 1);
        }

        let ack_id = AckId::new(self.id, self.sequence.load(Ordering::Acquire));
        let applied = match self.sink.write(&ack_id, &records) {
            Ok(applied) => applied,
            Err(e) => {
                error!(
                    importer = %self.id,
                    ack_id = %ack_id,
                    records = records.len(),
                    error = %e,
                    "Sink write failed, batch left unacknowledged"
                );
                return Err(e);
            },
        };
        pair.listener().on_progress_update(applied);

        let finished = records.iter().any(Record::is_finished);
        debug!(
            importer = %self.id,
            ack_id = %ack_id,
            records = records.len(),
            applied,
            finished,
            "Batch written"
        );

        self.pending.lock().insert(
            ack_id.sequence,
            PendingAck {
                pair_index,
                records,
            },
        );
        self.sequence.fetch_add(1, Ordering::AcqRel);

        if self.config.ack_mode == AckMode::Immediate {
            self.ack(&ack_id)?;
        }
        if finished {
            info!(importer = %self.id, pair = pair_index, "Pair finished");
        }
        Ok(finished)
    }
}

impl std::fmt::Debug for Importer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Importer")
            .field("id", &self.id)
            .field("pairs", &self.pairs.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::channel::{ChannelProducer, MemoryPipelineChannel};
    use crate::progress::JobItemProgress;
    use crate::sink::MemorySink;
    use cdcflow_common::{Column, DataRecord, DataRecordType, FinishedRecord, IngestPosition};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn insert(id: i64, csn: Option<u64>) -> Record {
        let record = DataRecord::new(DataRecordType::Insert, "t", IngestPosition::log("", id as u64))
            .with_column(Column::key("id", id));
        match csn {
            Some(csn) => record.with_csn(csn).into(),
            None => record.into(),
        }
    }

    fn finished() -> Record {
        FinishedRecord::new(IngestPosition::Finished).into()
    }

    struct Fixture {
        channel: Arc<MemoryPipelineChannel>,
        progress: Arc<JobItemProgress>,
        acked: Arc<Mutex<Vec<IngestPosition>>>,
        ack_calls: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::failing_first_acks(0)
        }

        /// The channel's ack callback fails its first `failures` calls.
        fn failing_first_acks(failures: usize) -> Self {
            let acked = Arc::new(Mutex::new(Vec::new()));
            let ack_calls = Arc::new(AtomicUsize::new(0));
            let seen = acked.clone();
            let calls = ack_calls.clone();
            let callback = move |records: &[Record]| -> Result<()> {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    return Err(PipelineError::PositionPersistence {
                        task: "t".to_string(),
                        reason: "position store unavailable".to_string(),
                    });
                }
                seen.lock().extend(records.iter().map(|r| r.position().clone()));
                Ok(())
            };
            Self {
                channel: Arc::new(MemoryPipelineChannel::new(16, Arc::new(callback))),
                progress: Arc::new(JobItemProgress::new()),
                acked,
                ack_calls,
            }
        }

        fn pair(&self) -> ChannelProgressPair {
            ChannelProgressPair::new(self.channel.clone(), self.progress.clone())
        }
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn config(sorted: bool, ack_mode: AckMode) -> ImporterConfig {
        ImporterConfig {
            batch_size: 10,
            fetch_timeout: 20,
            sorted,
            ack_mode,
            ..ImporterConfig::default()
        }
    }

    #[test]
    fn test_unsorted_writes_acks_and_reports_progress() {
        let fixture = Fixture::new();
        let sink = Arc::new(MemorySink::new());
        fixture
            .channel
            .push_records(vec![insert(1, None), insert(2, None), insert(3, None)])
            .unwrap();
        fixture.channel.push_records(vec![finished()]).unwrap();

        let importer = Importer::new(
            vec![fixture.pair()],
            sink.clone(),
            None,
            config(false, AckMode::Immediate),
        );
        importer.run().unwrap();

        assert_eq!(sink.row_count(), 3);
        assert_eq!(fixture.progress.processed_records(), 3);
        assert_eq!(fixture.acked.lock().last(), Some(&IngestPosition::Finished));
        assert_eq!(importer.pending_ack_count(), 0);
    }

    #[test]
    fn test_sink_failure_leaves_batch_unacked() {
        let fixture = Fixture::new();
        let sink = Arc::new(MemorySink::new());
        sink.set_failing(true);
        fixture.channel.push_records(vec![insert(1, None)]).unwrap();

        let importer = Importer::new(
            vec![fixture.pair()],
            sink,
            None,
            config(false, AckMode::Immediate),
        );
        let err = importer.run().unwrap_err();

        assert!(matches!(err, PipelineError::SinkWrite(_)));
        assert!(fixture.acked.lock().is_empty());
        assert_eq!(fixture.progress.processed_records(), 0);
    }

    #[test]
    fn test_deferred_ack_covers_earlier_batches() {
        let fixture = Fixture::new();
        let sink = Arc::new(MemorySink::new());
        for id in 1..=3 {
            fixture.channel.push_records(vec![insert(id, None)]).unwrap();
        }
        fixture.channel.push_records(vec![finished()]).unwrap();

        let importer = Arc::new(Importer::new(
            vec![fixture.pair()],
            sink.clone(),
            None,
            ImporterConfig {
                batch_size: 1,
                ..config(false, AckMode::Deferred)
            },
        ));
        let runner = importer.clone();
        let handle = thread::spawn(move || runner.run());

        wait_until(|| sink.written_batches().len() == 4);
        assert_eq!(importer.pending_ack_count(), 4);
        assert!(fixture.acked.lock().is_empty());
        // Everything is written, but the run waits for its acks.
        assert!(!handle.is_finished());

        let batches = sink.written_batches();
        assert_eq!(importer.ack(&batches[1].ack_id).unwrap(), 2);
        assert_eq!(
            *fixture.acked.lock(),
            vec![IngestPosition::log("", 1), IngestPosition::log("", 2)]
        );

        // Already acknowledged: accepted, nothing to do.
        assert_eq!(importer.ack(&batches[0].ack_id).unwrap(), 0);
        assert_eq!(importer.ack(&batches[3].ack_id).unwrap(), 2);
        assert_eq!(importer.pending_ack_count(), 0);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_failed_channel_ack_keeps_batches_for_retry() {
        let fixture = Fixture::failing_first_acks(1);
        let sink = Arc::new(MemorySink::new());
        for id in 1..=3 {
            fixture.channel.push_records(vec![insert(id, None)]).unwrap();
        }
        fixture.channel.push_records(vec![finished()]).unwrap();

        let importer = Arc::new(Importer::new(
            vec![fixture.pair()],
            sink.clone(),
            None,
            ImporterConfig {
                batch_size: 1,
                ..config(false, AckMode::Deferred)
            },
        ));
        let runner = importer.clone();
        let handle = thread::spawn(move || runner.run());
        wait_until(|| sink.written_batches().len() == 4);

        let last = sink.written_batches()[3].ack_id;
        let err = importer.ack(&last).unwrap_err();
        assert!(matches!(err, PipelineError::PositionPersistence { .. }));
        assert_eq!(importer.pending_ack_count(), 4);
        assert!(fixture.acked.lock().is_empty());

        assert_eq!(importer.ack(&last).unwrap(), 4);
        assert_eq!(fixture.ack_calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            *fixture.acked.lock(),
            vec![
                IngestPosition::log("", 1),
                IngestPosition::log("", 2),
                IngestPosition::log("", 3),
                IngestPosition::Finished,
            ]
        );
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_deferred_writes_block_at_pending_limit() {
        let fixture = Fixture::new();
        let sink = Arc::new(MemorySink::new());
        for id in 1..=4 {
            fixture.channel.push_records(vec![insert(id, None)]).unwrap();
        }
        fixture.channel.push_records(vec![finished()]).unwrap();

        let importer = Arc::new(Importer::new(
            vec![fixture.pair()],
            sink.clone(),
            None,
            ImporterConfig {
                batch_size: 1,
                max_pending_acks: 2,
                ..config(false, AckMode::Deferred)
            },
        ));
        let runner = importer.clone();
        let handle = thread::spawn(move || runner.run());

        wait_until(|| sink.written_batches().len() == 2);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(sink.written_batches().len(), 2);
        assert_eq!(importer.pending_ack_count(), 2);

        importer.ack(&sink.written_batches()[1].ack_id).unwrap();
        wait_until(|| sink.written_batches().len() == 4);
        importer.ack(&sink.written_batches()[3].ack_id).unwrap();
        wait_until(|| sink.written_batches().len() == 5);
        importer.ack(&sink.written_batches()[4].ack_id).unwrap();

        assert!(handle.join().unwrap().is_ok());
        assert_eq!(sink.row_count(), 4);
        assert_eq!(fixture.acked.lock().last(), Some(&IngestPosition::Finished));
    }

    #[test]
    fn test_stop_releases_importer_waiting_for_acks() {
        let fixture = Fixture::new();
        let sink = Arc::new(MemorySink::new());
        fixture.channel.push_records(vec![insert(1, None)]).unwrap();
        fixture.channel.push_records(vec![finished()]).unwrap();

        let importer = Arc::new(Importer::new(
            vec![fixture.pair()],
            sink.clone(),
            None,
            ImporterConfig {
                batch_size: 1,
                ..config(false, AckMode::Deferred)
            },
        ));
        let runner = importer.clone();
        let handle = thread::spawn(move || runner.run());
        wait_until(|| sink.written_batches().len() == 2);

        importer.stop();
        assert!(handle.join().unwrap().is_ok());
        assert_eq!(importer.pending_ack_count(), 2);
        assert!(fixture.acked.lock().is_empty());
    }

    #[test]
    fn test_unknown_ack_ids_are_rejected() {
        let fixture = Fixture::new();
        let importer = Importer::new(
            vec![fixture.pair()],
            Arc::new(MemorySink::new()),
            None,
            config(false, AckMode::Deferred),
        );

        let foreign = AckId::new(Uuid::new_v4(), 0);
        assert!(matches!(importer.ack(&foreign), Err(PipelineError::UnknownAckId(_))));
        let future = AckId::new(importer.id(), 0);
        assert!(matches!(importer.ack(&future), Err(PipelineError::UnknownAckId(_))));
    }

    #[test]
    fn test_sorted_merges_pairs_by_csn() {
        let first = Fixture::new();
        let second = Fixture::new();
        let sink = Arc::new(MemorySink::new());

        first.channel.push_records(vec![insert(1, Some(3))]).unwrap();
        second.channel.push_records(vec![insert(2, Some(1))]).unwrap();
        first.channel.push_records(vec![insert(3, Some(4))]).unwrap();
        second.channel.push_records(vec![insert(4, Some(2))]).unwrap();
        first.channel.push_records(vec![finished()]).unwrap();
        second.channel.push_records(vec![finished()]).unwrap();

        let importer = Importer::new(
            vec![first.pair(), second.pair()],
            sink.clone(),
            None,
            config(true, AckMode::Immediate),
        );
        importer.run().unwrap();

        let csns: Vec<u64> = sink
            .written_batches()
            .iter()
            .flat_map(|batch| batch.records.iter().filter_map(Record::csn))
            .collect();
        // Both batches of the second pair precede the first pair's head batch.
        assert_eq!(csns, vec![1, 2, 3, 4]);
        assert_eq!(first.progress.processed_records(), 2);
        assert_eq!(second.progress.processed_records(), 2);
        assert_eq!(first.acked.lock().last(), Some(&IngestPosition::Finished));
        assert_eq!(second.acked.lock().last(), Some(&IngestPosition::Finished));
    }

    #[test]
    fn test_sorted_merge_writes_placeholders_without_waiting() {
        let first = Fixture::new();
        let second = Fixture::new();
        let sink = Arc::new(MemorySink::new());

        first.channel.push_records(vec![insert(1, Some(5))]).unwrap();
        first.channel.push_records(vec![finished()]).unwrap();
        second.channel.push_records(vec![insert(2, None)]).unwrap();
        second.channel.push_records(vec![insert(3, Some(2))]).unwrap();
        second.channel.push_records(vec![finished()]).unwrap();

        let importer = Importer::new(
            vec![first.pair(), second.pair()],
            sink.clone(),
            None,
            config(true, AckMode::Immediate),
        );
        importer.run().unwrap();

        let order: Vec<Option<u64>> = sink
            .written_batches()
            .iter()
            .filter(|batch| batch.records.iter().all(|r| !r.is_finished()))
            .map(|batch| batch.records[0].csn())
            .collect();
        assert_eq!(order, vec![None, Some(2), Some(5)]);
        assert_eq!(sink.row_count(), 3);
    }

    #[test]
    fn test_idle_wait_is_bounded_on_both_sides() {
        use crate::config::TimeUnit;

        let fixture = Fixture::new();
        let importer = |fetch_timeout, fetch_timeout_unit| {
            Importer::new(
                vec![fixture.pair()],
                Arc::new(MemorySink::new()),
                None,
                ImporterConfig {
                    fetch_timeout,
                    fetch_timeout_unit,
                    ..config(true, AckMode::Immediate)
                },
            )
        };

        assert_eq!(importer(0, TimeUnit::Milliseconds).idle_wait(), MIN_IDLE_WAIT);
        assert_eq!(importer(20, TimeUnit::Milliseconds).idle_wait(), Duration::from_millis(20));
        assert_eq!(importer(5, TimeUnit::Seconds).idle_wait(), MAX_IDLE_WAIT);
    }

    #[test]
    fn test_stop_ends_run_on_closed_channel() {
        let fixture = Fixture::new();
        let importer = Arc::new(Importer::new(
            vec![fixture.pair()],
            Arc::new(MemorySink::new()),
            None,
            ImporterConfig {
                fetch_timeout: 5,
                fetch_timeout_unit: crate::config::TimeUnit::Seconds,
                ..config(false, AckMode::Immediate)
            },
        ));

        let runner = importer.clone();
        let handle = thread::spawn(move || runner.run());
        thread::sleep(Duration::from_millis(50));
        importer.stop();
        fixture.channel.close();

        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_closed_channel_without_stop_is_an_error() {
        let fixture = Fixture::new();
        fixture.channel.close();
        let importer = Importer::new(
            vec![fixture.pair()],
            Arc::new(MemorySink::new()),
            None,
            config(false, AckMode::Immediate),
        );

        let err = importer.run().unwrap_err();
        assert!(err.is_cancellation());
    }
}
