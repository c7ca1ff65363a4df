use std::fmt;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use super::block::{Block, BlockGuard};
use super::read_write::{BlockReadWrite, IoCounters};
use super::write_queue::BlockWriteQueue;
use crate::types::{BlockId, Result, StoreError, StoreId, STORE_ID_SPACE};

const MIN_CACHE_BYTES: u64 = 1024 * 1024;
const MAX_CACHE_BYTES: u64 = 128 * 1024 * 1024;

type BlockCache = LruCache<BlockId, Arc<Block>, BuildHasherDefault<FxHasher>>;

/// Number of cached blocks for a process allowed `max_memory_bytes`.
///
/// An eighth of the memory, clamped to `[1 MiB, 128 MiB]`, divided into
/// blocks and rounded down to a power of two.
pub fn cache_capacity(max_memory_bytes: u64, block_size: usize) -> usize {
    let budget = (max_memory_bytes / 8).clamp(MIN_CACHE_BYTES, MAX_CACHE_BYTES);
    let blocks = (budget / block_size.max(1) as u64).max(1);
    1usize << (63 - blocks.leading_zeros())
}

/// Bitmap over the store id space; id 0 is permanently reserved.
pub struct StoreIdAllocator {
    words: Vec<u64>,
    allocated: usize,
    hint: usize,
}

impl Default for StoreIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreIdAllocator {
    /// Creates an allocator with only the reserved id taken.
    pub fn new() -> Self {
        let mut words = vec![0u64; STORE_ID_SPACE / 64];
        words[0] = 1;
        Self {
            words,
            allocated: 0,
            hint: 0,
        }
    }

    /// Hands out the lowest free id at or after the last allocation, wrapping.
    pub fn allocate(&mut self) -> Result<StoreId> {
        let count = self.words.len();
        for step in 0..count {
            let index = (self.hint + step) % count;
            let word = self.words[index];
            if word != u64::MAX {
                let bit = (!word).trailing_zeros() as usize;
                self.words[index] |= 1 << bit;
                self.allocated += 1;
                self.hint = index;
                return Ok(StoreId((index * 64 + bit) as u16));
            }
        }
        error!(allocated = self.allocated, "block_manager.store_id.exhausted");
        Err(StoreError::StoreIdsExhausted)
    }

    /// Returns `id` to the free set.
    pub fn free(&mut self, id: StoreId) -> Result<()> {
        if !id.is_valid() {
            error!(store = %id, "block_manager.store_id.free_reserved");
            return Err(StoreError::InvalidStoreId(id.0 as u32));
        }
        let (index, mask) = Self::slot(id);
        if self.words[index] & mask == 0 {
            error!(store = %id, "block_manager.store_id.double_free");
            return Err(StoreError::StoreIdNotAllocated(id));
        }
        self.words[index] &= !mask;
        self.allocated -= 1;
        Ok(())
    }

    /// True if `id` is currently handed out.
    pub fn is_allocated(&self, id: StoreId) -> bool {
        let (index, mask) = Self::slot(id);
        id.is_valid() && self.words[index] & mask != 0
    }

    /// Number of ids handed out.
    pub fn len(&self) -> usize {
        self.allocated
    }

    /// True if no ids are handed out.
    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    fn slot(id: StoreId) -> (usize, u64) {
        let raw = id.0 as usize;
        (raw / 64, 1u64 << (raw % 64))
    }
}

/// Cache and I/O counters for monitoring.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BlockManagerStats {
    /// `get_block` calls served from the cache.
    pub hits: u64,
    /// `get_block` calls that created a block.
    pub misses: u64,
    /// `misses / (hits + misses)`, or 0 before any lookup.
    pub miss_rate: f64,
    /// Blocks read from disk.
    pub block_reads: u64,
    /// Blocks written to disk.
    pub block_writes: u64,
    /// Blocks dropped from the cache to respect capacity.
    pub evictions: u64,
    /// Blocks currently cached.
    pub cached_blocks: usize,
    /// Target cache size in blocks.
    pub capacity: usize,
    /// Blocks waiting for write-back.
    pub queue_len: usize,
}

impl fmt::Display for BlockManagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} miss_rate={:.4} reads={} writes={} evictions={} cached={}/{} queued={}",
            self.hits,
            self.misses,
            self.miss_rate,
            self.block_reads,
            self.block_writes,
            self.evictions,
            self.cached_blocks,
            self.capacity,
            self.queue_len
        )
    }
}

/// LRU cache of blocks shared by every store of an engine.
pub struct BlockManager {
    cache: Mutex<BlockCache>,
    capacity: usize,
    store_ids: Mutex<StoreIdAllocator>,
    queue: Arc<BlockWriteQueue>,
    counters: Arc<IoCounters>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BlockManager {
    /// Creates a manager caching up to `capacity` blocks.
    pub fn new(capacity: usize, queue: Arc<BlockWriteQueue>, counters: Arc<IoCounters>) -> Self {
        let capacity = capacity.max(1);
        debug!(capacity, "block_manager.new");
        Self {
            cache: Mutex::new(LruCache::unbounded_with_hasher(BuildHasherDefault::default())),
            capacity,
            store_ids: Mutex::new(StoreIdAllocator::new()),
            queue,
            counters,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Target number of cached blocks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The shared write-back queue.
    pub fn queue(&self) -> &Arc<BlockWriteQueue> {
        &self.queue
    }

    /// Shared physical I/O counters.
    pub fn counters(&self) -> &Arc<IoCounters> {
        &self.counters
    }

    /// Reserves a fresh store id.
    pub fn allocate_store_id(&self) -> Result<StoreId> {
        let id = self.store_ids.lock().allocate()?;
        trace!(store = %id, "block_manager.store_id.allocate");
        Ok(id)
    }

    /// Releases a store id.
    pub fn free_store_id(&self, id: StoreId) -> Result<()> {
        self.store_ids.lock().free(id)?;
        trace!(store = %id, "block_manager.store_id.free");
        Ok(())
    }

    /// Number of blocks currently cached.
    pub fn cached_blocks(&self) -> usize {
        self.cache.lock().len()
    }

    /// True if a block for `id` is cached.
    pub fn contains(&self, id: BlockId) -> bool {
        self.cache.lock().contains(&id)
    }

    /// Returns the pinned, loaded block `id` of the store behind `io`.
    ///
    /// Concurrent callers asking for the same uncached id all receive the
    /// same instance, and only one of them reads it from disk.
    pub fn get_block(&self, io: &Arc<BlockReadWrite>, id: BlockId) -> Result<BlockGuard> {
        let store = io.store_id();
        if id.store_id() != store {
            error!(block = %id, store = %store, "block_manager.get_block.store_mismatch");
            return Err(StoreError::StoreMismatch { block: id, store });
        }
        loop {
            let cached = self.cache.lock().get(&id).cloned();
            if let Some(block) = cached {
                if block.try_pin() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    trace!(block = %id, "block_manager.get_block.hit");
                    let guard = BlockGuard::from_pinned(block);
                    self.load(&guard)?;
                    return Ok(guard);
                }
                // Claimed by eviction between lookup and pin.
                self.remove_if_same(&block);
                continue;
            }

            let candidate = Arc::new(Block::new_pinned(id, Arc::clone(io)));
            let inserted = {
                let mut cache = self.cache.lock();
                if cache.contains(&id) {
                    false
                } else {
                    cache.put(id, Arc::clone(&candidate));
                    // Victims reach the queue before the lock is released so a
                    // reload of the same id always finds their bytes.
                    let victims = self.evict_locked(&mut cache);
                    if let Err(err) = self.dispose(victims) {
                        cache.pop(&id);
                        candidate.unpin();
                        return Err(err);
                    }
                    true
                }
            };
            if !inserted {
                trace!(block = %id, "block_manager.get_block.lost_race");
                candidate.unpin();
                candidate.destroy()?;
                continue;
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(block = %id, "block_manager.get_block.miss");
            let guard = BlockGuard::from_pinned(candidate);
            self.load(&guard)?;
            return Ok(guard);
        }
    }

    /// Loads content once, preferring still-queued bytes over the file.
    fn load(&self, guard: &BlockGuard) -> Result<()> {
        let block = guard.block();
        let id = block.id();
        let queue = &self.queue;
        let result = block.ensure_loaded(|data| {
            if queue.copy_dirty_into(id, data) {
                Ok(())
            } else {
                block.io().read_block(id, data)
            }
        });
        if let Err(err) = result {
            error!(block = %id, error = %err, "block_manager.load_failed");
            self.remove_if_same(block);
            return Err(err);
        }
        Ok(())
    }

    fn remove_if_same(&self, block: &Arc<Block>) {
        let mut cache = self.cache.lock();
        if cache
            .peek(&block.id())
            .is_some_and(|cached| Arc::ptr_eq(cached, block))
        {
            cache.pop(&block.id());
        }
    }

    /// Pops least-recently-used unpinned blocks until the cache fits.
    fn evict_locked(&self, cache: &mut BlockCache) -> Vec<Arc<Block>> {
        let mut victims = Vec::new();
        while cache.len() > self.capacity {
            let victim = cache
                .iter()
                .rev()
                .find(|(_, block)| block.try_claim_for_eviction())
                .map(|(id, _)| *id);
            match victim.and_then(|id| cache.pop(&id)) {
                Some(block) => victims.push(block),
                None => {
                    debug!(len = cache.len(), capacity = self.capacity, "block_manager.evict.all_pinned");
                    break;
                }
            }
        }
        victims
    }

    /// Hands dirty evictees to the writer and releases the rest.
    ///
    /// Called with the cache lock held; may park on a full queue.
    fn dispose(&self, victims: Vec<Arc<Block>>) -> Result<()> {
        let mut first_err = None;
        for block in victims {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(block = %block.id(), dirty = block.is_dirty(), "block_manager.evict");
            if let Err(err) = self.release(&block) {
                error!(block = %block.id(), error = %err, "block_manager.evict.release_failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Hands a block leaving the cache to the writer if dirty, then destroys it.
    ///
    /// Once the queue is closed the bytes are written synchronously instead.
    fn release(&self, block: &Arc<Block>) -> Result<()> {
        if block.is_dirty() {
            match self.queue.add_dirty_block(block) {
                Ok(_) => {}
                Err(StoreError::Closed) => {
                    warn!(block = %block.id(), "block_manager.release.sync_write");
                    let bytes = block.snapshot_for_write();
                    if let Err(err) = block.io().write_block(block.address(), &bytes, true) {
                        block.mark_dirty();
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        block.destroy()?;
        Ok(())
    }

    /// Queues every dirty cached block, optionally only those of `store`.
    ///
    /// Returns how many blocks were newly queued. Does not wait for disk.
    pub fn flush(&self, store: Option<StoreId>) -> Result<usize> {
        let dirty: Vec<Arc<Block>> = self
            .cache
            .lock()
            .iter()
            .filter(|(id, block)| {
                block.is_dirty() && store.map_or(true, |s| id.store_id() == s)
            })
            .map(|(_, block)| Arc::clone(block))
            .collect();
        let mut queued = 0;
        for block in &dirty {
            if self.queue.add_dirty_block(block)? {
                queued += 1;
            }
        }
        if queued > 0 {
            debug!(store = ?store.map(|s| s.0), queued, "block_manager.flush");
        }
        Ok(queued)
    }

    /// Drops every cached block of `store`, queueing any still dirty.
    pub fn free_store(&self, store: StoreId) -> Result<usize> {
        let mut cache = self.cache.lock();
        let ids: Vec<BlockId> = cache
            .iter()
            .filter(|(id, _)| id.store_id() == store)
            .map(|(id, _)| *id)
            .collect();
        let blocks: Vec<Arc<Block>> = ids.iter().filter_map(|id| cache.pop(id)).collect();
        let count = blocks.len();
        let mut first_err = None;
        for block in &blocks {
            if block.pin_count() > 0 {
                warn!(block = %block.id(), pins = block.pin_count(), "block_manager.free_store.pinned");
            }
            if let Err(err) = self.release(block) {
                error!(block = %block.id(), error = %err, "block_manager.free_store.release_failed");
                first_err.get_or_insert(err);
            }
        }
        drop(cache);
        debug!(store = %store, count, "block_manager.free_store");
        match first_err {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> BlockManagerStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        BlockManagerStats {
            hits,
            misses,
            miss_rate: if lookups == 0 {
                0.0
            } else {
                misses as f64 / lookups as f64
            },
            block_reads: self.counters.reads(),
            block_writes: self.counters.writes(),
            evictions: self.evictions.load(Ordering::Relaxed),
            cached_blocks: self.cached_blocks(),
            capacity: self.capacity,
            queue_len: self.queue.len(),
        }
    }
}
