use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use super::engine::StorageEngine;
use crate::primitives::pager::{BlockGuard, BlockReadWrite};
use crate::types::{BlockId, Result, StoreId};

/// One open store: a named file whose blocks are served by the engine's cache.
pub struct BlockStore {
    engine: StorageEngine,
    id: StoreId,
    name: String,
    io: Arc<BlockReadWrite>,
    closed: AtomicBool,
}

impl fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.io.path())
            .finish()
    }
}

impl BlockStore {
    pub(crate) fn new(
        engine: StorageEngine,
        id: StoreId,
        name: String,
        io: Arc<BlockReadWrite>,
    ) -> Self {
        Self {
            engine,
            id,
            name,
            io,
            closed: AtomicBool::new(false),
        }
    }

    /// Store id, unique among the engine's open stores.
    pub fn id(&self) -> StoreId {
        self.id
    }

    /// Name given at open time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        self.io.path()
    }

    /// Synchronous block I/O for this store.
    pub fn io(&self) -> &Arc<BlockReadWrite> {
        &self.io
    }

    /// Block size shared by every store of the engine.
    pub fn block_size(&self) -> usize {
        self.io.block_size()
    }

    /// Current file length.
    pub fn file_size(&self) -> u64 {
        self.io.file_size()
    }

    /// Id of block `index` in this store.
    pub fn block_id(&self, index: u64) -> BlockId {
        BlockId::new(self.id, index)
    }

    /// Pinned block `index`.
    pub fn get_block(&self, index: u64) -> Result<BlockGuard> {
        self.engine.get_block(self, self.block_id(index))
    }

    /// Queues this store's dirty blocks for write-back.
    pub fn flush(&self) -> Result<usize> {
        self.engine.flush_store(self.id)
    }

    /// Forces bytes already written to the file onto disk.
    pub fn fsync(&self) -> Result<()> {
        self.io.fsync()
    }

    /// Flushes dirty blocks, waits for them to be written and fsyncs.
    ///
    /// Returns false if the queue did not drain within the close timeout.
    pub fn sync_all(&self) -> Result<bool> {
        self.flush()?;
        let drained = self
            .engine
            .wait_for_writes(self.engine.options().close_timeout());
        self.fsync()?;
        Ok(drained)
    }

    /// Writes back and evicts this store's blocks, closes the file and frees the id.
    ///
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = &self.engine.inner;
        let timeout = inner.options.close_timeout();
        // A closed queue takes no more work; free_store writes those blocks itself.
        let mut result = if inner.queue.is_closed() {
            Ok(())
        } else {
            inner.manager.flush(Some(self.id)).map(drop)
        };
        if !inner.queue.wait_for_complete(timeout) {
            warn!(store = %self.id, queued = inner.queue.len(), "store.close.drain_timeout");
        }
        result = result.and(inner.manager.free_store(self.id).map(drop));
        inner.queue.wait_for_complete(timeout);
        result = result.and(self.io.close());
        result = result.and(inner.manager.free_store_id(self.id));
        info!(store = %self.id, name = %self.name, path = %self.path().display(), "store.close");
        result
    }

    /// Closes the store and deletes its file.
    pub fn remove(self) -> Result<()> {
        self.close()?;
        fs::remove_file(self.path())?;
        info!(store = %self.id, path = %self.path().display(), "store.remove");
        Ok(())
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(store = %self.id, error = %err, "store.drop.close_failed");
        }
    }
}
