//! Multiplexed channel
//!
//! Fans one logical record stream out over N [`MemoryPipelineChannel`]s so N consumers
//! can drain it in parallel. Routing keeps every change of a row on one sub-channel,
//! so per-row order survives the fan-out:
//!
//! | Record | Destination |
//! |---|---|
//! | `DataRecord` | `routing_hash % N` |
//! | `PlaceholderRecord` | sub-channel 0 |
//! | `FinishedRecord` | every sub-channel |
//!
//! A batch made only of inserts has no ordering dependency between its rows, so it is
//! routed whole by the hash of its first record. Any other multi-record batch is split
//! and routed record by record. An update that changes a row's key routes by the new
//! key, so it is not ordered against earlier changes made under the old key.
//!
//! Consumers register explicitly through [`MultiplexPipelineChannel::consumer`], which
//! binds the returned [`MultiplexConsumer`] to the lowest sub-channel not yet claimed.

use std::sync::Arc;
use std::time::Duration;

use cdcflow_common::{PipelineError, Record, Result};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{AckCallback, ChannelProducer, MemoryPipelineChannel, PipelineChannel};

/// Producer-side handle of a multiplexed channel. Cloning shares the sub-channels.
#[derive(Clone)]
pub struct MultiplexPipelineChannel {
    inner: Arc<MultiplexInner>,
}

struct MultiplexInner {
    channels: Vec<MemoryPipelineChannel>,
    claimed: Mutex<Vec<bool>>,
}

impl MultiplexPipelineChannel {
    /// `channel_count` is clamped to at least one sub-channel. Every sub-channel shares
    /// `ack_callback`.
    pub fn new(channel_count: usize, capacity: usize, ack_callback: Arc<dyn AckCallback>) -> Self {
        let channel_count = channel_count.max(1);
        let channels = (0..channel_count)
            .map(|_| MemoryPipelineChannel::new(capacity, ack_callback.clone()))
            .collect();

        Self {
            inner: Arc::new(MultiplexInner {
                channels,
                claimed: Mutex::new(vec![false; channel_count]),
            }),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Register a consumer, bound for its lifetime to the lowest unclaimed sub-channel.
    pub fn consumer(&self) -> Result<MultiplexConsumer> {
        let mut claimed = self.inner.claimed.lock();
        let index = claimed.iter().position(|taken| !taken).ok_or(
            PipelineError::ConsumerLimitExceeded {
                channel_count: self.channel_count(),
            },
        )?;
        claimed[index] = true;
        debug!(index, channel_count = self.channel_count(), "Consumer bound to sub-channel");

        Ok(MultiplexConsumer {
            inner: self.inner.clone(),
            index,
        })
    }

    /// Buffered batches per sub-channel
    pub fn buffered_batches(&self) -> Vec<usize> {
        self.inner.channels.iter().map(MemoryPipelineChannel::len).collect()
    }
}

impl MultiplexInner {
    fn push(&self, records: Vec<Record>) -> Result<()> {
        if records.len() > 1 && records.iter().all(Record::is_insert) {
            let index = self.index_of(&records[0]);
            trace!(index, records = records.len(), "Routing insert batch whole");
            return self.channels[index].push_records(records);
        }
        records
            .into_iter()
            .try_for_each(|record| self.push_record(record))
    }

    fn push_record(&self, record: Record) -> Result<()> {
        match record {
            Record::Finished(_) => {
                for channel in &self.channels {
                    channel.push_records(vec![record.clone()])?;
                }
                Ok(())
            },
            Record::Placeholder(_) => self.channels[0].push_records(vec![record]),
            Record::Data(_) => {
                let index = self.index_of(&record);
                self.channels[index].push_records(vec![record])
            },
        }
    }

    fn index_of(&self, record: &Record) -> usize {
        match record {
            Record::Data(data) => (data.routing_hash() % self.channels.len() as u64) as usize,
            Record::Placeholder(_) | Record::Finished(_) => 0,
        }
    }

    fn close(&self) {
        for channel in &self.channels {
            channel.close();
        }
    }
}

impl ChannelProducer for MultiplexPipelineChannel {
    fn push_records(&self, records: Vec<Record>) -> Result<()> {
        self.inner.push(records)
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// Consumer handle bound to one sub-channel of a [`MultiplexPipelineChannel`]
pub struct MultiplexConsumer {
    inner: Arc<MultiplexInner>,
    index: usize,
}

impl MultiplexConsumer {
    /// Index of the bound sub-channel
    pub fn index(&self) -> usize {
        self.index
    }

    fn channel(&self) -> &MemoryPipelineChannel {
        &self.inner.channels[self.index]
    }
}

impl ChannelProducer for MultiplexConsumer {
    fn push_records(&self, records: Vec<Record>) -> Result<()> {
        self.inner.push(records)
    }

    fn close(&self) {
        self.inner.close();
    }
}

impl PipelineChannel for MultiplexConsumer {
    fn fetch_records(&self, batch_size: usize, timeout: Duration) -> Result<Vec<Record>> {
        self.channel().fetch_records(batch_size, timeout)
    }

    fn peek_records(&self) -> Vec<Record> {
        self.channel().peek_records()
    }

    fn poll_records(&self) -> Vec<Record> {
        self.channel().poll_records()
    }

    fn ack(&self, records: &[Record]) -> Result<()> {
        self.channel().ack(records)
    }
}
