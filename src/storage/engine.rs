use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use super::options::EngineOptions;
use super::store::BlockStore;
use crate::primitives::pager::{
    BlockGuard, BlockManager, BlockManagerStats, BlockReadWrite, BlockWriteQueue, IoCounters,
};
use crate::types::{BlockId, Result, StoreError, StoreId};

/// Wakes the flusher early and tells it to stop.
#[derive(Default)]
struct FlusherSignal {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

pub(crate) struct EngineInner {
    pub(crate) options: EngineOptions,
    pub(crate) manager: Arc<BlockManager>,
    pub(crate) queue: Arc<BlockWriteQueue>,
    counters: Arc<IoCounters>,
    writer: Mutex<Option<JoinHandle<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    flusher_signal: Arc<FlusherSignal>,
    shut_down: AtomicBool,
}

/// Handle to one block cache, its write-back worker, and the stores using them.
///
/// Cloning is cheap; every clone refers to the same engine. Dropping the
/// last handle (including those held by open stores) shuts the engine down.
#[derive(Clone)]
pub struct StorageEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl StorageEngine {
    /// Validates `options`, builds the cache and starts the background threads.
    pub fn start(options: EngineOptions) -> Result<Self> {
        options.validate()?;
        let counters = Arc::new(IoCounters::default());
        let queue = Arc::new(BlockWriteQueue::new(
            options.write_queue_capacity,
            options.write_queue_park(),
        ));
        let manager = Arc::new(BlockManager::new(
            options.cache_capacity(),
            Arc::clone(&queue),
            Arc::clone(&counters),
        ));

        let writer = {
            let queue = Arc::clone(&queue);
            thread::Builder::new()
                .name("blockstore-writer".into())
                .spawn(move || queue.run_writer())?
        };

        let flusher_signal = Arc::new(FlusherSignal::default());
        let flusher = match options.flush_interval_ms {
            Some(ms) => {
                let manager = Arc::clone(&manager);
                let signal = Arc::clone(&flusher_signal);
                let interval = Duration::from_millis(ms);
                let spawned = thread::Builder::new()
                    .name("blockstore-flusher".into())
                    .spawn(move || run_flusher(&manager, &signal, interval));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        queue.close();
                        let _ = writer.join();
                        return Err(err.into());
                    }
                }
            }
            None => None,
        };

        info!(
            capacity = manager.capacity(),
            block_size = options.block_size,
            queue_capacity = queue.capacity(),
            mmap = options.enable_mmap,
            flush_interval_ms = ?options.flush_interval_ms,
            "engine.start"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                options,
                manager,
                queue,
                counters,
                writer: Mutex::new(Some(writer)),
                flusher: Mutex::new(flusher),
                flusher_signal,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Options the engine was started with.
    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// The shared block cache.
    pub fn manager(&self) -> &Arc<BlockManager> {
        &self.inner.manager
    }

    /// The shared write-back queue.
    pub fn write_queue(&self) -> &Arc<BlockWriteQueue> {
        &self.inner.queue
    }

    /// True once [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Creates a new store file at `path`; fails if it already exists.
    pub fn create_store(&self, name: &str, path: impl AsRef<Path>) -> Result<BlockStore> {
        self.attach(name, path.as_ref(), true)
    }

    /// Opens the existing store file at `path`.
    pub fn open_store(&self, name: &str, path: impl AsRef<Path>) -> Result<BlockStore> {
        self.attach(name, path.as_ref(), false)
    }

    fn attach(&self, name: &str, path: &Path, create: bool) -> Result<BlockStore> {
        self.ensure_running()?;
        let id = self.inner.manager.allocate_store_id()?;
        let io = Arc::new(BlockReadWrite::new(
            id,
            path,
            self.inner.options.io_options(),
            Arc::clone(&self.inner.counters),
        ));
        let opened = if create { io.create() } else { io.init() };
        if let Err(err) = opened {
            self.inner.manager.free_store_id(id)?;
            return Err(err);
        }
        info!(
            store = %id,
            name,
            path = %path.display(),
            create,
            file_size = io.file_size(),
            "engine.attach_store"
        );
        Ok(BlockStore::new(self.clone(), id, name.to_owned(), io))
    }

    /// Returns the pinned block `id` of `store`.
    pub fn get_block(&self, store: &BlockStore, id: BlockId) -> Result<BlockGuard> {
        self.ensure_running()?;
        self.inner.manager.get_block(store.io(), id)
    }

    /// Queues every dirty cached block; returns how many were queued.
    pub fn flush(&self) -> Result<usize> {
        self.inner.manager.flush(None)
    }

    /// Queues the dirty cached blocks of one store.
    pub fn flush_store(&self, store: StoreId) -> Result<usize> {
        self.inner.manager.flush(Some(store))
    }

    /// Waits up to `timeout` for queued writes to reach the files.
    pub fn wait_for_writes(&self, timeout: Duration) -> bool {
        self.inner.queue.wait_for_complete(timeout)
    }

    /// Cache and I/O counters.
    pub fn stats(&self) -> BlockManagerStats {
        self.inner.manager.stats()
    }

    /// Flushes everything, drains the queue and stops the background threads.
    ///
    /// Idempotent; also run when the last handle is dropped.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown()
    }
}

impl EngineInner {
    fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut stopped = self.flusher_signal.stopped.lock();
            *stopped = true;
            self.flusher_signal.wakeup.notify_all();
        }
        join("blockstore-flusher", self.flusher.lock().take());

        let flushed = self.manager.flush(None);
        let timeout = self.options.close_timeout();
        if !self.queue.wait_for_complete(timeout) {
            warn!(
                queued = self.queue.len(),
                timeout_ms = self.options.close_timeout_ms,
                "engine.shutdown.drain_timeout"
            );
        }
        self.queue.close();
        join("blockstore-writer", self.writer.lock().take());
        info!(stats = %self.manager.stats(), "engine.shutdown");
        flushed.map(drop)
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "engine.drop.shutdown_failed");
        }
    }
}

fn join(name: &str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            error!(thread = name, "engine.thread_panicked");
        }
    }
}

/// Periodically queues dirty blocks until signalled to stop.
fn run_flusher(manager: &BlockManager, signal: &FlusherSignal, interval: Duration) {
    debug!(interval_ms = interval.as_millis() as u64, "engine.flusher.start");
    let mut stopped = signal.stopped.lock();
    while !*stopped {
        let timed_out = signal.wakeup.wait_for(&mut stopped, interval).timed_out();
        if *stopped {
            break;
        }
        if !timed_out {
            continue;
        }
        let result = MutexGuard::unlocked(&mut stopped, || manager.flush(None));
        match result {
            Ok(0) => {}
            Ok(queued) => trace!(queued, "engine.flusher.tick"),
            Err(StoreError::Closed) => break,
            Err(err) => warn!(error = %err, "engine.flusher.flush_failed"),
        }
    }
    debug!("engine.flusher.stop");
}
