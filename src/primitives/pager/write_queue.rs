use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use super::block::{Block, BlockState, WriteCompletion};
use crate::types::{BlockId, Result, StoreError};

/// Default number of queued blocks before producers block.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 1024;
/// Default park interval for a producer waiting on a full queue.
pub const DEFAULT_PARK: Duration = Duration::from_millis(100);

struct QueueState {
    entries: VecDeque<Arc<Block>>,
    closed: bool,
    enqueued: u64,
    written: u64,
}

/// Counters describing queue throughput.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteQueueStats {
    /// Entries currently queued, including one in flight.
    pub len: usize,
    /// Total successful enqueues.
    pub enqueued: u64,
    /// Total entries removed after their write was attempted.
    pub written: u64,
}

/// Bounded FIFO of dirty blocks waiting for the write-back worker.
///
/// The head entry stays queued while its write is in flight, so
/// [`copy_dirty_block`](Self::copy_dirty_block) can still see it.
pub struct BlockWriteQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    park: Duration,
    not_full: Condvar,
    not_empty: Condvar,
}

impl BlockWriteQueue {
    /// Creates a queue holding at most `capacity` blocks.
    pub fn new(capacity: usize, park: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity),
                closed: false,
                enqueued: 0,
                written: 0,
            }),
            capacity,
            park,
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Maximum number of queued blocks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued blocks, including the one being written.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True after [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Snapshot of the queue counters.
    pub fn stats(&self) -> WriteQueueStats {
        let state = self.state.lock();
        WriteQueueStats {
            len: state.entries.len(),
            enqueued: state.enqueued,
            written: state.written,
        }
    }

    /// Queues `block` for write-back, blocking while the queue is full.
    ///
    /// Returns false when the block was already queued (its newest content
    /// will be picked up by the pending write) or has been destroyed.
    pub fn add_dirty_block(&self, block: &Arc<Block>) -> Result<bool> {
        if block.state() == BlockState::WriteQueued {
            return Ok(false);
        }
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(StoreError::Closed);
            }
            if state.entries.len() < self.capacity {
                break;
            }
            trace!(block = %block.id(), len = state.entries.len(), "write_queue.add.park");
            self.not_full.wait_for(&mut state, self.park);
        }
        if !block.mark_write_queued()? {
            return Ok(false);
        }
        state.entries.push_back(Arc::clone(block));
        state.enqueued += 1;
        drop(state);
        self.not_empty.notify_one();
        Ok(true)
    }

    /// Copies the newest queued content for `id` into `dst`.
    pub fn copy_dirty_into(&self, id: BlockId, dst: &mut [u8]) -> bool {
        let state = self.state.lock();
        match state.entries.iter().rev().find(|entry| entry.id() == id) {
            Some(entry) => {
                entry.copy_into(dst);
                trace!(block = %id, "write_queue.copy_dirty");
                true
            }
            None => false,
        }
    }

    /// Copies the newest queued content for `id` into `target`.
    ///
    /// Returns false when nothing for `id` is pending.
    pub fn copy_dirty_block(&self, id: BlockId, target: &Block) -> bool {
        match self.find_block(id) {
            None => false,
            Some(entry) if std::ptr::eq(Arc::as_ptr(&entry), target) => true,
            Some(entry) => {
                target.overwrite_with(|dst| entry.copy_into(dst));
                true
            }
        }
    }

    /// Newest queued block with `id`, if any.
    pub fn find_block(&self, id: BlockId) -> Option<Arc<Block>> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .rev()
            .find(|entry| entry.id() == id)
            .cloned()
    }

    /// Head of the queue without removing it.
    pub fn peek_first_block(&self) -> Option<Arc<Block>> {
        self.state.lock().entries.front().cloned()
    }

    /// Removes the head of the queue and wakes blocked producers.
    pub fn remove_first_block(&self) -> Option<Arc<Block>> {
        let mut state = self.state.lock();
        let block = state.entries.pop_front()?;
        state.written += 1;
        drop(state);
        self.not_full.notify_all();
        Some(block)
    }

    /// Waits until every queued block has been written or `timeout` expires.
    ///
    /// Returns true if the queue drained. Expiry only stops the wait.
    pub fn wait_for_complete(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.entries.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                debug!(len = state.entries.len(), "write_queue.wait_for_complete.timeout");
                return false;
            }
            let slice = (deadline - now).min(self.park);
            self.not_full.wait_for(&mut state, slice);
        }
        true
    }

    /// Stops accepting new blocks; the worker drains what is left and exits.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            debug!(len = state.entries.len(), "write_queue.close");
        }
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Blocks until there is a head entry, or returns None once closed and empty.
    fn next_block(&self) -> Option<Arc<Block>> {
        let mut state = self.state.lock();
        loop {
            if let Some(block) = state.entries.front() {
                return Some(Arc::clone(block));
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Consumer loop run by the write-back thread until the queue is closed and drained.
    pub fn run_writer(&self) {
        debug!(capacity = self.capacity, "write_queue.writer.start");
        while let Some(block) = self.next_block() {
            if self.write_head(&block) == HeadOutcome::Failed {
                thread::sleep(self.park);
            }
        }
        debug!("write_queue.writer.stop");
    }

    /// Writes one head entry: snapshot, write, then settle it.
    fn write_head(&self, block: &Arc<Block>) -> HeadOutcome {
        let bytes = block.snapshot_for_write();
        let result = block.io().write_block(block.address(), &bytes, false);
        self.settle_head(block, result)
    }

    /// Retires or rotates the head after its write was attempted.
    ///
    /// Runs under the queue lock so the entry is never absent from the queue
    /// while its newest bytes are still unwritten.
    fn settle_head(&self, block: &Arc<Block>, result: Result<()>) -> HeadOutcome {
        let mut state = self.state.lock();
        let outcome = match result {
            Ok(()) => match block.finish_write() {
                Ok(WriteCompletion::Redirtied) => {
                    trace!(block = %block.id(), "write_queue.writer.requeue");
                    HeadOutcome::Requeued
                }
                Ok(WriteCompletion::Done(_)) => HeadOutcome::Written,
                Err(err) => {
                    error!(block = %block.id(), error = %err, "write_queue.writer.complete_failed");
                    HeadOutcome::Written
                }
            },
            Err(err) => {
                block.mark_dirty();
                // A closed store or a closed queue has nowhere left to retry.
                if matches!(err, StoreError::Closed) || state.closed {
                    error!(
                        block = %block.id(),
                        destroy_pending = block.destroy_pending(),
                        error = %err,
                        "write_queue.writer.write_abandoned"
                    );
                    if let Err(err) = block.complete_write() {
                        error!(block = %block.id(), error = %err, "write_queue.writer.complete_failed");
                    }
                    HeadOutcome::Written
                } else {
                    warn!(block = %block.id(), error = %err, "write_queue.writer.write_failed");
                    HeadOutcome::Failed
                }
            }
        };
        if let Some(head) = state.entries.pop_front() {
            debug_assert!(Arc::ptr_eq(&head, block), "settled entry is not the head");
            state.written += 1;
            if outcome != HeadOutcome::Written {
                state.entries.push_back(head);
                state.enqueued += 1;
            }
        }
        drop(state);
        self.not_full.notify_all();
        outcome
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum HeadOutcome {
    /// Left the queue.
    Written,
    /// Moved to the tail because newer bytes arrived during the write.
    Requeued,
    /// Moved to the tail after a failed write; retried after a pause.
    Failed,
}
