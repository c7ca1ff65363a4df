use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{error, trace};

use super::read_write::BlockReadWrite;
use crate::types::{BlockId, Result, StoreError, StoreId};

/// Pin count value marking a block claimed by eviction.
const EVICTED: u32 = u32::MAX;

/// Lifecycle of a cached block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// Allocated, content not yet loaded.
    Init,
    /// Content loaded and usable.
    Valid,
    /// Waiting in the write-back queue.
    WriteQueued,
    /// Released; absorbs every further transition.
    Destroyed,
}

/// Outcome of [`Block::finish_write`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteCompletion {
    /// The written bytes were the newest; the block left the queue in this state.
    Done(BlockState),
    /// Dirtied while the write was in flight; still `WriteQueued`.
    Redirtied,
}

#[derive(Debug)]
struct StateCell {
    state: BlockState,
    destroy_pending: bool,
}

/// One fixed-size page of a store file held in the cache.
pub struct Block {
    id: BlockId,
    io: Arc<BlockReadWrite>,
    pins: AtomicU32,
    dirty: AtomicBool,
    state: Mutex<StateCell>,
    loaded: Mutex<bool>,
    data: RwLock<Box<[u8]>>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("pins", &self.pins.load(Ordering::Relaxed))
            .field("dirty", &self.is_dirty())
            .field("state", &self.state())
            .finish()
    }
}

impl Block {
    /// Allocates an unpinned block of `io.block_size()` zero bytes in [`BlockState::Init`].
    pub fn new(id: BlockId, io: Arc<BlockReadWrite>) -> Self {
        let size = io.block_size();
        Self {
            id,
            io,
            pins: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            state: Mutex::new(StateCell {
                state: BlockState::Init,
                destroy_pending: false,
            }),
            loaded: Mutex::new(false),
            data: RwLock::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    /// Like [`Block::new`] but already holding one pin.
    pub fn new_pinned(id: BlockId, io: Arc<BlockReadWrite>) -> Self {
        let block = Self::new(id, io);
        block.pins.store(1, Ordering::Release);
        block
    }

    /// Identifier of this block.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Store owning this block.
    pub fn store_id(&self) -> StoreId {
        self.id.store_id()
    }

    /// I/O layer of the owning store.
    pub fn io(&self) -> &Arc<BlockReadWrite> {
        &self.io
    }

    /// Byte address of this block in its store file.
    pub fn address(&self) -> u64 {
        self.id.address(self.io.block_size())
    }

    /// Current pin count; 0 when unpinned or claimed by eviction.
    pub fn pin_count(&self) -> u32 {
        match self.pins.load(Ordering::Acquire) {
            EVICTED => 0,
            pins => pins,
        }
    }

    /// True once eviction has claimed the block.
    pub fn is_evicted(&self) -> bool {
        self.pins.load(Ordering::Acquire) == EVICTED
    }

    /// Adds a pin unless the block has been evicted.
    pub fn try_pin(&self) -> bool {
        let mut current = self.pins.load(Ordering::Acquire);
        loop {
            if current == EVICTED || current == EVICTED - 1 {
                return false;
            }
            match self.pins.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops one pin.
    pub fn unpin(&self) {
        let previous = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous != 0 && previous != EVICTED, "unpin without pin");
    }

    /// Claims an unpinned block for eviction; fails if anyone holds a pin.
    pub fn try_claim_for_eviction(&self) -> bool {
        self.pins
            .compare_exchange(0, EVICTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True if content changed since it was last handed to the writer.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Flags the content as changed.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Current state.
    pub fn state(&self) -> BlockState {
        self.state.lock().state
    }

    /// True once a destroy request is waiting for the queued write.
    pub fn destroy_pending(&self) -> bool {
        self.state.lock().destroy_pending
    }

    /// Applies a transition and returns `(from, resulting state)`.
    fn apply(&self, to: BlockState) -> Result<(BlockState, BlockState)> {
        let mut cell = self.state.lock();
        self.step(&mut cell, to)
    }

    fn step(&self, cell: &mut StateCell, to: BlockState) -> Result<(BlockState, BlockState)> {
        use BlockState::*;
        let from = cell.state;
        let next = match (from, to) {
            (Destroyed, _) => Destroyed,
            (Init, Valid) | (Valid, Valid) => Valid,
            (Init, Destroyed) | (Valid, Destroyed) => Destroyed,
            (Valid, WriteQueued) | (WriteQueued, WriteQueued) => WriteQueued,
            (WriteQueued, Destroyed) => {
                cell.destroy_pending = true;
                WriteQueued
            }
            (WriteQueued, Valid) if cell.destroy_pending => Destroyed,
            (WriteQueued, Valid) => Valid,
            (from, to) => {
                error!(block = %self.id, ?from, ?to, "block.state.illegal_transition");
                return Err(StoreError::IllegalTransition { from, to });
            }
        };
        cell.state = next;
        if next != from {
            trace!(block = %self.id, ?from, ?next, "block.state");
        }
        Ok((from, next))
    }

    /// Requests a transition; returns the state the block ended up in.
    pub fn transition(&self, to: BlockState) -> Result<BlockState> {
        self.apply(to).map(|(_, next)| next)
    }

    /// Moves `Valid -> WriteQueued`. Returns false if it was already queued or destroyed.
    pub fn mark_write_queued(&self) -> Result<bool> {
        let (from, next) = self.apply(BlockState::WriteQueued)?;
        Ok(from == BlockState::Valid && next == BlockState::WriteQueued)
    }

    /// Finishes a queued write unconditionally; a deferred destroy takes effect here.
    pub fn complete_write(&self) -> Result<BlockState> {
        self.transition(BlockState::Valid)
    }

    /// Finishes a written queue entry unless the block was dirtied again.
    ///
    /// The dirty check and the transition happen under the state lock, so a
    /// writer that dirties the block and an eviction that then sees it
    /// `WriteQueued` can never both miss the newer bytes.
    pub fn finish_write(&self) -> Result<WriteCompletion> {
        let mut cell = self.state.lock();
        if cell.state == BlockState::WriteQueued && self.is_dirty() {
            return Ok(WriteCompletion::Redirtied);
        }
        self.step(&mut cell, BlockState::Valid)
            .map(|(_, next)| WriteCompletion::Done(next))
    }

    /// Requests destruction; deferred while a write is queued.
    pub fn destroy(&self) -> Result<BlockState> {
        self.transition(BlockState::Destroyed)
    }

    /// Loads content exactly once; concurrent callers wait for the first.
    ///
    /// Returns true if this call performed the load.
    pub fn ensure_loaded<F>(&self, fill: F) -> Result<bool>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let mut loaded = self.loaded.lock();
        if *loaded {
            return Ok(false);
        }
        {
            let mut data = self.data.write();
            fill(&mut data[..])?;
        }
        self.transition(BlockState::Valid)?;
        *loaded = true;
        Ok(true)
    }

    /// True once content has been loaded.
    pub fn is_loaded(&self) -> bool {
        *self.loaded.lock()
    }

    /// Copies the content for the writer and clears the dirty flag atomically
    /// with respect to writers.
    pub fn snapshot_for_write(&self) -> Vec<u8> {
        let data = self.data.read();
        self.dirty.store(false, Ordering::Release);
        data.to_vec()
    }

    /// Copies the current content into `dst`.
    pub fn copy_into(&self, dst: &mut [u8]) {
        let data = self.data.read();
        let len = dst.len().min(data.len());
        dst[..len].copy_from_slice(&data[..len]);
    }

    /// Overwrites content through `fill` under the content lock.
    pub fn overwrite_with<F, R>(&self, fill: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut data = self.data.write();
        fill(&mut data[..])
    }

    pub(crate) fn read_data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.data.read(), |data| &**data)
    }

    pub(crate) fn write_data(&self) -> BlockWrite<'_> {
        BlockWrite {
            block: self,
            data: self.data.write(),
        }
    }
}

/// Pinned handle to a cached block; unpins on drop.
pub struct BlockGuard {
    block: Arc<Block>,
}

impl BlockGuard {
    /// Wraps a block the caller has already pinned.
    pub(crate) fn from_pinned(block: Arc<Block>) -> Self {
        Self { block }
    }

    /// Identifier of the pinned block.
    pub fn id(&self) -> BlockId {
        self.block.id
    }

    /// Shared reference to the underlying block.
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    /// Locks the content for reading.
    pub fn read(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        self.block.read_data()
    }

    /// Locks the content for writing; the block is marked dirty on release.
    pub fn write(&self) -> BlockWrite<'_> {
        self.block.write_data()
    }

    /// Returns true if the pinned instance is the same object as `other`'s.
    pub fn same_block(&self, other: &BlockGuard) -> bool {
        Arc::ptr_eq(&self.block, &other.block)
    }
}

impl Clone for BlockGuard {
    fn clone(&self) -> Self {
        // Holding a pin rules out eviction, so a plain increment is safe.
        self.block.pins.fetch_add(1, Ordering::AcqRel);
        Self {
            block: Arc::clone(&self.block),
        }
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        self.block.unpin();
    }
}

impl fmt::Debug for BlockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlockGuard").field(&self.block).finish()
    }
}

/// Exclusive view of a block's bytes; marks the block dirty when dropped.
pub struct BlockWrite<'a> {
    block: &'a Block,
    data: RwLockWriteGuard<'a, Box<[u8]>>,
}

impl Deref for BlockWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for BlockWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for BlockWrite<'_> {
    fn drop(&mut self) {
        // Runs before `data` is released, so the writer never snapshots
        // these bytes without also seeing the flag.
        self.block.mark_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::pager::{BlockIoOptions, IoCounters};
    use tempfile::tempdir;

    fn block() -> (tempfile::TempDir, Block) {
        let dir = tempdir().unwrap();
        let io = BlockReadWrite::new(
            StoreId(1),
            dir.path().join("b.db"),
            BlockIoOptions::default(),
            Arc::new(IoCounters::default()),
        );
        (dir, Block::new(BlockId::new(StoreId(1), 0), Arc::new(io)))
    }

    #[test]
    fn legal_transitions() -> Result<()> {
        let (_dir, block) = block();
        assert_eq!(block.state(), BlockState::Init);
        assert_eq!(block.transition(BlockState::Valid)?, BlockState::Valid);
        assert_eq!(block.transition(BlockState::Valid)?, BlockState::Valid);
        assert!(block.mark_write_queued()?);
        assert!(!block.mark_write_queued()?, "re-queue is idempotent");
        assert_eq!(block.complete_write()?, BlockState::Valid);
        assert_eq!(block.destroy()?, BlockState::Destroyed);
        assert_eq!(block.transition(BlockState::Valid)?, BlockState::Destroyed);
        assert!(!block.mark_write_queued()?);
        Ok(())
    }

    #[test]
    fn illegal_transitions_are_rejected() -> Result<()> {
        let (_dir, block) = block();
        assert!(matches!(
            block.transition(BlockState::WriteQueued),
            Err(StoreError::IllegalTransition {
                from: BlockState::Init,
                to: BlockState::WriteQueued
            })
        ));
        block.transition(BlockState::Valid)?;
        assert!(matches!(
            block.transition(BlockState::Init),
            Err(StoreError::IllegalTransition { .. })
        ));
        block.mark_write_queued()?;
        assert!(block.transition(BlockState::Init).is_err());
        assert_eq!(block.state(), BlockState::WriteQueued);
        Ok(())
    }

    #[test]
    fn destroy_waits_for_queued_write() -> Result<()> {
        let (_dir, block) = block();
        block.transition(BlockState::Valid)?;
        block.mark_write_queued()?;
        assert_eq!(block.destroy()?, BlockState::WriteQueued);
        assert!(block.destroy_pending());
        assert_eq!(block.complete_write()?, BlockState::Destroyed);
        Ok(())
    }

    #[test]
    fn finish_write_keeps_redirtied_block_queued() -> Result<()> {
        let (_dir, block) = block();
        block.transition(BlockState::Valid)?;
        block.mark_write_queued()?;
        block.snapshot_for_write();
        block.write_data()[0] = 1;
        assert_eq!(block.destroy()?, BlockState::WriteQueued);
        assert_eq!(block.finish_write()?, WriteCompletion::Redirtied);
        assert_eq!(block.state(), BlockState::WriteQueued);

        block.snapshot_for_write();
        assert_eq!(
            block.finish_write()?,
            WriteCompletion::Done(BlockState::Destroyed)
        );
        Ok(())
    }

    #[test]
    fn eviction_claim_excludes_pins() {
        let (_dir, block) = block();
        assert!(block.try_pin());
        assert!(!block.try_claim_for_eviction());
        block.unpin();
        assert!(block.try_claim_for_eviction());
        assert!(block.is_evicted());
        assert!(!block.try_pin());
        assert_eq!(block.pin_count(), 0);
    }

    #[test]
    fn write_view_marks_dirty_and_snapshot_clears() -> Result<()> {
        let (_dir, block) = block();
        let loads = block.ensure_loaded(|data| {
            data.fill(3);
            Ok(())
        })?;
        assert!(loads);
        assert!(!block.ensure_loaded(|_| unreachable!("loaded once"))?);
        assert!(!block.is_dirty());
        {
            let mut view = block.write_data();
            view[0] = 9;
        }
        assert!(block.is_dirty());
        let snapshot = block.snapshot_for_write();
        assert_eq!(snapshot[0], 9);
        assert_eq!(snapshot[1], 3);
        assert!(!block.is_dirty());
        Ok(())
    }
}
