//! Record channels
//!
//! A channel is the bounded buffer between a dumper (producer) and an importer
//! (consumer). Producers only see [`ChannelProducer`]; consumers get the full
//! [`PipelineChannel`] so they can fetch and acknowledge.
//!
//! Two implementations exist:
//!
//! - [`MemoryPipelineChannel`]: one bounded queue of record batches
//! - [`MultiplexPipelineChannel`]: N memory channels behind one producer, routing
//!   records by row identity so N consumers can drain in parallel

pub mod memory;
pub mod multiplex;

use std::sync::Arc;
use std::time::Duration;

use cdcflow_common::{Record, Result};

use crate::config::ChannelConfig;
use crate::progress::ProgressListener;

pub use memory::MemoryPipelineChannel;
pub use multiplex::{MultiplexConsumer, MultiplexPipelineChannel};

/// Notified when records are acknowledged by the importer.
///
/// Implementations typically persist the position of the last record so capture can
/// resume from there.
pub trait AckCallback: Send + Sync {
    fn on_ack(&self, records: &[Record]) -> Result<()>;
}

impl<F> AckCallback for F
where
    F: Fn(&[Record]) -> Result<()> + Send + Sync,
{
    fn on_ack(&self, records: &[Record]) -> Result<()> {
        self(records)
    }
}

/// Producer side of a channel
pub trait ChannelProducer: Send + Sync {
    /// Push one batch, blocking while the buffer is full.
    ///
    /// Returns [`PipelineError::ChannelClosed`](cdcflow_common::PipelineError::ChannelClosed)
    /// if the channel is closed before the batch could be buffered.
    fn push_records(&self, records: Vec<Record>) -> Result<()>;

    /// Drop all buffered batches and wake every blocked producer and consumer.
    fn close(&self);
}

/// Consumer side of a channel
pub trait PipelineChannel: ChannelProducer {
    /// Accumulate whole batches until `batch_size` records are collected or `timeout`
    /// elapses. May return fewer records than requested, or none.
    fn fetch_records(&self, batch_size: usize, timeout: Duration) -> Result<Vec<Record>>;

    /// The oldest buffered batch, left in place. Empty if nothing is buffered.
    fn peek_records(&self) -> Vec<Record>;

    /// The oldest buffered batch, removed. Empty if nothing is buffered.
    fn poll_records(&self) -> Vec<Record>;

    /// Forward acknowledged records to the channel's ack callback.
    fn ack(&self, records: &[Record]) -> Result<()>;
}

/// A channel bound to the listener that tracks its progress.
///
/// Importers servicing several channels use the pair to route progress to the right
/// task.
#[derive(Clone)]
pub struct ChannelProgressPair {
    channel: Arc<dyn PipelineChannel>,
    listener: Arc<dyn ProgressListener>,
}

impl ChannelProgressPair {
    pub fn new(channel: Arc<dyn PipelineChannel>, listener: Arc<dyn ProgressListener>) -> Self {
        Self { channel, listener }
    }

    pub fn channel(&self) -> &Arc<dyn PipelineChannel> {
        &self.channel
    }

    pub fn listener(&self) -> &Arc<dyn ProgressListener> {
        &self.listener
    }
}

impl std::fmt::Debug for ChannelProgressPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelProgressPair").finish_non_exhaustive()
    }
}

/// A channel as created for one task
pub enum TaskChannel {
    Single(Arc<MemoryPipelineChannel>),
    Multiplex(MultiplexPipelineChannel),
}

impl TaskChannel {
    /// Producer handle for the task's dumper
    pub fn producer(&self) -> Arc<dyn ChannelProducer> {
        match self {
            TaskChannel::Single(channel) => channel.clone(),
            TaskChannel::Multiplex(channel) => Arc::new(channel.clone()),
        }
    }

    /// One consumer per sub-channel (a single consumer for a plain channel)
    pub fn consumers(&self) -> Result<Vec<Arc<dyn PipelineChannel>>> {
        match self {
            TaskChannel::Single(channel) => Ok(vec![channel.clone() as Arc<dyn PipelineChannel>]),
            TaskChannel::Multiplex(channel) => (0..channel.channel_count())
                .map(|_| channel.consumer().map(|c| Arc::new(c) as Arc<dyn PipelineChannel>))
                .collect(),
        }
    }

    pub fn close(&self) {
        match self {
            TaskChannel::Single(channel) => channel.close(),
            TaskChannel::Multiplex(channel) => channel.close(),
        }
    }
}

/// Create the channel for one task: a plain memory channel for a single consumer, a
/// multiplexed one otherwise.
pub fn create_channel(config: &ChannelConfig, ack_callback: Arc<dyn AckCallback>) -> TaskChannel {
    if config.consumer_concurrency <= 1 {
        TaskChannel::Single(Arc::new(MemoryPipelineChannel::new(
            config.capacity,
            ack_callback,
        )))
    } else {
        TaskChannel::Multiplex(MultiplexPipelineChannel::new(
            config.consumer_concurrency,
            config.capacity,
            ack_callback,
        ))
    }
}
