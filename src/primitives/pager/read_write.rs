use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::primitives::chunked::{
    align_up, StoreBuilder, DEFAULT_FILE_SIZE_INCREMENT, DEFAULT_MAX_CHUNK_SIZE,
};
use crate::primitives::concurrency::Semaphore;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::stream::StoreStream;
use crate::types::{BlockId, Result, StoreError, StoreId, DEFAULT_BLOCK_SIZE};

/// Tuning for one store's block I/O.
#[derive(Clone, Debug)]
pub struct BlockIoOptions {
    /// Size of every block in bytes.
    pub block_size: usize,
    /// Unit the file grows by.
    pub file_size_increment: u64,
    /// Upper bound for the mmap chunk size.
    pub mmap_max_chunk_size: u64,
    /// Try the mapped backend first.
    pub enable_mmap: bool,
    /// Concurrent non-priority handle users.
    pub max_open_handles: usize,
    /// Idle handles kept open for reuse.
    pub handle_pool_size: usize,
    /// Attempts before a short read is fatal.
    pub read_retries: u32,
}

impl Default for BlockIoOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            file_size_increment: DEFAULT_FILE_SIZE_INCREMENT,
            mmap_max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            enable_mmap: true,
            max_open_handles: 8,
            handle_pool_size: 4,
            read_retries: 10,
        }
    }
}

/// Physical read/write counters shared by every store of an engine.
#[derive(Debug, Default)]
pub struct IoCounters {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl IoCounters {
    /// Blocks read from disk.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Blocks written to disk.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

enum Backend<'a> {
    Mapped(&'a StoreStream),
    Plain(&'a StdFileIo),
}

/// Synchronous block I/O for one store file.
///
/// Serves reads and writes through a mapped [`StoreStream`] while that
/// works and through pooled positioned-I/O handles otherwise. The first
/// mapped failure switches the store to plain I/O for good.
pub struct BlockReadWrite {
    store_id: StoreId,
    path: PathBuf,
    options: BlockIoOptions,
    counters: Arc<IoCounters>,
    file_lock: Mutex<()>,
    file_size: AtomicU64,
    mapped: RwLock<Option<StoreStream>>,
    mmap_enabled: AtomicBool,
    handles: Mutex<Vec<StdFileIo>>,
    semaphore: Semaphore,
    closed: AtomicBool,
}

impl BlockReadWrite {
    /// Builds the I/O layer for `path`; nothing is opened until `create` or `init`.
    pub fn new(
        store_id: StoreId,
        path: impl AsRef<Path>,
        options: BlockIoOptions,
        counters: Arc<IoCounters>,
    ) -> Self {
        let semaphore = Semaphore::new(options.max_open_handles);
        let mmap_enabled = options.enable_mmap;
        Self {
            store_id,
            path: path.as_ref().to_path_buf(),
            options,
            counters,
            file_lock: Mutex::new(()),
            file_size: AtomicU64::new(0),
            mapped: RwLock::new(None),
            mmap_enabled: AtomicBool::new(mmap_enabled),
            handles: Mutex::new(Vec::new()),
            semaphore,
            closed: AtomicBool::new(false),
        }
    }

    /// Store served by this I/O layer.
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.options.block_size
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current logical file length.
    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    /// True while the mapped backend is in use (or still to be tried).
    pub fn is_mmap_enabled(&self) -> bool {
        self.mmap_enabled.load(Ordering::Acquire)
    }

    /// Shared physical I/O counters.
    pub fn counters(&self) -> &Arc<IoCounters> {
        &self.counters
    }

    /// Creates the backing file; fails if it already exists.
    pub fn create(&self) -> Result<()> {
        if self.path.exists() {
            return Err(StoreError::AlreadyExists(self.path.clone()));
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let io = StdFileIo::create_new(&self.path)?;
        self.file_size.store(0, Ordering::Release);
        self.handles.lock().push(io);
        info!(store = %self.store_id, path = %self.path.display(), "block_io.create");
        Ok(())
    }

    /// Opens the existing backing file and records its length.
    pub fn init(&self) -> Result<()> {
        let io = StdFileIo::open(&self.path)?;
        let len = io.len()?;
        self.file_size.store(len, Ordering::Release);
        self.handles.lock().push(io);
        info!(store = %self.store_id, path = %self.path.display(), file_size = len, "block_io.init");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Mapped stream, opening it on first use. None once mmap is disabled.
    fn mapped_stream(&self) -> Option<StoreStream> {
        if !self.is_mmap_enabled() {
            return None;
        }
        if let Some(stream) = self.mapped.read().as_ref() {
            return Some(stream.clone());
        }
        let mut slot = self.mapped.write();
        if let Some(stream) = slot.as_ref() {
            return Some(stream.clone());
        }
        if !self.is_mmap_enabled() {
            return None;
        }
        let builder = StoreBuilder::new(&self.path)
            .mmap(true)
            .file_size_increment(self.options.file_size_increment)
            .max_chunk_size(self.options.mmap_max_chunk_size);
        let opened = if builder.uses_mmap() {
            StoreStream::open(builder)
        } else {
            Err(StoreError::Invalid("memory mapping unsupported on this platform"))
        };
        match opened {
            Ok(stream) => {
                self.file_size.fetch_max(stream.len(), Ordering::AcqRel);
                debug!(
                    store = %self.store_id,
                    chunk_size = stream.chunk_size(),
                    file_size = stream.len(),
                    "block_io.mmap.open"
                );
                *slot = Some(stream.clone());
                Some(stream)
            }
            Err(err) => {
                self.mmap_enabled.store(false, Ordering::Release);
                warn!(store = %self.store_id, error = %err, "block_io.mmap.fallback");
                None
            }
        }
    }

    fn disable_mmap(&self, err: &StoreError) {
        if self.mmap_enabled.swap(false, Ordering::AcqRel) {
            warn!(store = %self.store_id, error = %err, "block_io.mmap.fallback");
        }
        // Outstanding views keep their maps alive; new work goes to plain I/O.
        self.mapped.write().take();
    }

    /// Runs `op` against a pooled plain handle.
    fn with_handle<R>(&self, priority: bool, op: impl FnOnce(&StdFileIo) -> Result<R>) -> Result<R> {
        let _permit = if priority {
            None
        } else {
            Some(self.semaphore.acquire())
        };
        let pooled = self.handles.lock().pop();
        let handle = match pooled {
            Some(handle) => handle,
            None => StdFileIo::open(&self.path)?,
        };
        let result = op(&handle);
        let mut handles = self.handles.lock();
        if handles.len() < self.options.handle_pool_size.max(1) {
            handles.push(handle);
        }
        result
    }

    /// Runs `op` on the mapped backend, falling back to plain I/O on an I/O failure.
    fn with_backend<R>(
        &self,
        priority: bool,
        mut op: impl FnMut(Backend<'_>) -> Result<R>,
    ) -> Result<R> {
        self.ensure_open()?;
        if let Some(stream) = self.mapped_stream() {
            match op(Backend::Mapped(&stream)) {
                Err(StoreError::Io(err)) => self.disable_mmap(&StoreError::Io(err)),
                other => return other,
            }
        }
        self.with_handle(priority, |io| op(Backend::Plain(io)))
    }

    /// Grows the file in whole increments so `end` bytes are addressable.
    pub fn extend_file(&self, end: u64) -> Result<()> {
        if end <= self.file_size() {
            return Ok(());
        }
        let _lock = self.file_lock.lock();
        let old = self.file_size();
        if end <= old {
            return Ok(());
        }
        let target = align_up(end, self.options.file_size_increment);
        let new_size = self.with_backend(true, |backend| match backend {
            Backend::Mapped(stream) => {
                stream.reserve(target)?;
                Ok(stream.len())
            }
            Backend::Plain(io) => {
                if io.len()? < target {
                    io.truncate(target)?;
                }
                Ok(target)
            }
        })?;
        self.file_size.fetch_max(new_size, Ordering::AcqRel);
        debug!(store = %self.store_id, old, new_size, "block_io.extend_file");
        Ok(())
    }

    /// Reads block `id` into `buf`, retrying short reads.
    pub fn read_block(&self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        if id.store_id() != self.store_id {
            error!(block = %id, store = %self.store_id, "block_io.read_block.store_mismatch");
            return Err(StoreError::StoreMismatch {
                block: id,
                store: self.store_id,
            });
        }
        let address = id.address(self.block_size());
        self.extend_file(address + buf.len() as u64)?;

        let attempts = self.options.read_retries.max(1);
        let mut last = 0;
        for attempt in 1..=attempts {
            let read = self.with_backend(false, |backend| match backend {
                Backend::Mapped(stream) => stream.read(address, &mut buf[..]),
                Backend::Plain(io) => io.read_some_at(address, &mut buf[..]),
            })?;
            if read == buf.len() {
                self.counters.reads.fetch_add(1, Ordering::Relaxed);
                trace!(block = %id, address, "block_io.read_block");
                return Ok(());
            }
            last = read;
            debug!(block = %id, attempt, read, "block_io.read_block.short");
        }
        error!(
            block = %id,
            address,
            read = last,
            expected = buf.len(),
            attempts,
            "block_io.read_block.unreadable"
        );
        Err(StoreError::UnreadableBlock(id))
    }

    /// Writes `buf` at `address`, growing the file first if needed.
    pub fn write_block(&self, address: u64, buf: &[u8], is_priority: bool) -> Result<()> {
        self.extend_file(address + buf.len() as u64)?;
        self.with_backend(is_priority, |backend| match backend {
            Backend::Mapped(stream) => stream.write(address, buf),
            Backend::Plain(io) => io.write_at(address, buf),
        })?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        trace!(store = %self.store_id, address, len = buf.len(), "block_io.write_block");
        Ok(())
    }

    /// Forces written blocks to disk. Bypasses handle throttling.
    pub fn fsync(&self) -> Result<()> {
        self.with_backend(true, |backend| match backend {
            Backend::Mapped(stream) => stream.fsync(),
            Backend::Plain(io) => io.sync_all(),
        })
    }

    /// Syncs, releases the mapped stream and drains pooled handles. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut result = Ok(());
        if let Some(stream) = self.mapped.write().take() {
            result = stream.close();
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        if let Some(io) = handles.first() {
            if let Err(err) = io.sync_all() {
                result = result.and(Err(err));
            }
        }
        info!(store = %self.store_id, path = %self.path.display(), "block_io.close");
        result
    }
}
