//! Single-queue memory channel

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cdcflow_common::{PipelineError, Record, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::{AckCallback, ChannelProducer, PipelineChannel};

/// Bounded FIFO of record batches.
///
/// Each push occupies exactly one slot regardless of its size, so a batch is never split
/// across slots. Producers block while all `capacity` slots are taken; consumers are
/// woken as soon as a batch arrives.
pub struct MemoryPipelineChannel {
    capacity: usize,
    state: Mutex<ChannelState>,
    not_empty: Condvar,
    not_full: Condvar,
    ack_callback: Arc<dyn AckCallback>,
}

#[derive(Default)]
struct ChannelState {
    batches: VecDeque<Vec<Record>>,
    closed: bool,
}

impl MemoryPipelineChannel {
    /// `capacity` is clamped to at least one slot.
    pub fn new(capacity: usize, ack_callback: Arc<dyn AckCallback>) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(ChannelState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            ack_callback,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered batches
    pub fn len(&self) -> usize {
        self.state.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl ChannelProducer for MemoryPipelineChannel {
    fn push_records(&self, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        while !state.closed && state.batches.len() >= self.capacity {
            trace!(capacity = self.capacity, "Channel full, producer waiting");
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(PipelineError::ChannelClosed);
        }

        state.batches.push_back(records);
        self.not_empty.notify_one();
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            debug!(dropped_batches = state.batches.len(), "Closing channel");
        }
        state.closed = true;
        state.batches.clear();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

impl PipelineChannel for MemoryPipelineChannel {
    fn fetch_records(&self, batch_size: usize, timeout: Duration) -> Result<Vec<Record>> {
        let deadline = Instant::now() + timeout;
        let mut result = Vec::new();
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(PipelineError::ChannelClosed);
            }

            let mut drained = false;
            while result.len() < batch_size {
                match state.batches.pop_front() {
                    Some(batch) => {
                        result.extend(batch);
                        drained = true;
                    },
                    None => break,
                }
            }
            // Freed slots must reach blocked producers before we wait for more data.
            if drained {
                self.not_full.notify_all();
            }

            if result.len() >= batch_size || Instant::now() >= deadline {
                return Ok(result);
            }

            self.not_empty.wait_until(&mut state, deadline);
        }
    }

    fn peek_records(&self) -> Vec<Record> {
        self.state
            .lock()
            .batches
            .front()
            .cloned()
            .unwrap_or_default()
    }

    fn poll_records(&self) -> Vec<Record> {
        let mut state = self.state.lock();
        match state.batches.pop_front() {
            Some(batch) => {
                self.not_full.notify_one();
                batch
            },
            None => Vec::new(),
        }
    }

    fn ack(&self, records: &[Record]) -> Result<()> {
        self.ack_callback.on_ack(records)
    }
}
