#![allow(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace};

use super::geometry::{align_up, chunk_size_for, extend_file_size};
use super::{InStore, OutStore, StoreReadWrite};
use crate::primitives::concurrency::{GenerationPool, Stamped};
use crate::types::{Result, StoreError};

const CURSOR_POOL_SIZE: usize = 8;

/// One mapped window of the file.
struct MappedChunk {
    address: u64,
    map: Mutex<MmapMut>,
}

/// Append-only list of mapped chunks; chunk `i` covers `[i * chunk_size, (i + 1) * chunk_size)`.
struct ChunkTable {
    chunk_size: u64,
    chunks: Vec<Arc<MappedChunk>>,
}

impl ChunkTable {
    fn empty(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            chunks: Vec::new(),
        }
    }

    fn mapped_len(&self) -> u64 {
        self.chunks.len() as u64 * self.chunk_size
    }

    fn covers(&self, end: u64) -> bool {
        end <= self.mapped_len()
    }

    /// Visits every chunk slice overlapping `[address, address + len)`.
    fn for_each_span<F>(&self, address: u64, len: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&MappedChunk, usize, std::ops::Range<usize>) -> Result<()>,
    {
        let mut pos = address;
        let mut done = 0usize;
        while done < len {
            let idx = (pos / self.chunk_size) as usize;
            let chunk = self.chunks.get(idx).ok_or(StoreError::OutOfRange {
                address,
                len,
                start: 0,
                end: self.mapped_len(),
            })?;
            let offset = (pos - chunk.address) as usize;
            let room = self.chunk_size as usize - offset;
            let take = room.min(len - done);
            f(chunk, offset, done..done + take)?;
            done += take;
            pos += take as u64;
        }
        Ok(())
    }
}

/// Pooled accessor bound to the chunk table it was created from.
struct ChunkCursor {
    table: Arc<ChunkTable>,
}

impl ChunkCursor {
    fn read(&self, address: u64, dst: &mut [u8]) -> Result<()> {
        let len = dst.len();
        self.table.for_each_span(address, len, |chunk, offset, span| {
            let map = chunk.map.lock();
            dst[span.clone()].copy_from_slice(&map[offset..offset + span.len()]);
            Ok(())
        })
    }

    fn write(&self, address: u64, src: &[u8]) -> Result<()> {
        self.table
            .for_each_span(address, src.len(), |chunk, offset, span| {
                let n = span.len();
                let mut map = chunk.map.lock();
                map[offset..offset + n].copy_from_slice(&src[span]);
                Ok(())
            })
    }
}

/// Memory-mapped store that grows by appending fixed-size chunks.
pub struct MmapStoreReadWrite {
    path: PathBuf,
    increment: u64,
    max_chunk: u64,
    file: RwLock<Option<File>>,
    file_size: AtomicU64,
    chunks: RwLock<Arc<ChunkTable>>,
    grow_lock: Mutex<()>,
    cursors: GenerationPool<ChunkCursor>,
    closed: AtomicBool,
}

impl MmapStoreReadWrite {
    /// Creates an unopened store for `path`.
    pub fn new(path: PathBuf, increment: u64, max_chunk: u64) -> Self {
        Self {
            path,
            increment,
            max_chunk,
            file: RwLock::new(None),
            file_size: AtomicU64::new(0),
            chunks: RwLock::new(Arc::new(ChunkTable::empty(increment))),
            grow_lock: Mutex::new(()),
            cursors: GenerationPool::new(CURSOR_POOL_SIZE),
            closed: AtomicBool::new(false),
        }
    }

    /// Generation of the chunk table; bumped every time a chunk is appended.
    pub fn sequence(&self) -> u64 {
        self.cursors.current()
    }

    /// Number of chunks currently mapped.
    pub fn mapped_chunks(&self) -> usize {
        self.table().chunks.len()
    }

    fn table(&self) -> Arc<ChunkTable> {
        Arc::clone(&self.chunks.read())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn fresh_cursor(&self) -> Stamped<ChunkCursor> {
        // Read the generation before the table so a concurrent append can
        // only make the stamp look older than the table, never newer.
        let generation = self.cursors.current();
        Stamped::new(
            ChunkCursor {
                table: self.table(),
            },
            generation,
        )
    }

    fn checkout_cursor(&self) -> Stamped<ChunkCursor> {
        self.cursors
            .checkout()
            .unwrap_or_else(|| self.fresh_cursor())
    }

    fn init_impl(&self, file: File) -> Result<()> {
        let on_disk = file.metadata()?.len();
        let chunk_size = chunk_size_for(on_disk, self.increment, self.max_chunk);
        let target = align_up(on_disk, chunk_size);
        if target > on_disk {
            file.set_len(target)?;
        }
        *self.file.write() = Some(file);
        *self.chunks.write() = Arc::new(ChunkTable::empty(chunk_size));
        self.file_size.store(target, Ordering::Release);
        self.closed.store(false, Ordering::Release);
        if target > 0 {
            self.map_through(target)?;
        }
        debug!(
            path = %self.path.display(),
            file_size = target,
            chunk_size,
            chunks = self.mapped_chunks(),
            "chunked.mmap.init"
        );
        Ok(())
    }

    /// Grows the file (if needed) and maps every chunk below `end`.
    fn map_through(&self, end: u64) -> Result<()> {
        if self.table().covers(end) {
            return Ok(());
        }
        let _grow = self.grow_lock.lock();
        let table = self.table();
        if table.covers(end) {
            return Ok(());
        }
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(StoreError::Closed)?;
        let chunk_size = table.chunk_size;
        let old_size = self.file_size.load(Ordering::Acquire);
        let new_size = extend_file_size(old_size, end, self.increment, chunk_size);
        if new_size % chunk_size != 0 {
            return Err(StoreError::Corruption("store size is not chunk aligned"));
        }
        if file.metadata()?.len() < new_size {
            file.set_len(new_size)?;
        }
        self.file_size.fetch_max(new_size, Ordering::AcqRel);

        let mut chunks = table.chunks.clone();
        let mut address = table.mapped_len();
        while address < new_size {
            // SAFETY: the file was extended to cover `address + chunk_size`
            // above and is never truncated while mapped. Every access through
            // the map is serialized by the chunk's mutex.
            let map = unsafe {
                MmapOptions::new()
                    .offset(address)
                    .len(chunk_size as usize)
                    .map_mut(file)
            }
            .map_err(|err| {
                error!(path = %self.path.display(), address, error = %err, "chunked.mmap.map_failed");
                StoreError::Io(err)
            })?;
            chunks.push(Arc::new(MappedChunk {
                address,
                map: Mutex::new(map),
            }));
            address += chunk_size;
        }
        let count = chunks.len();
        *self.chunks.write() = Arc::new(ChunkTable { chunk_size, chunks });
        let sequence = self.cursors.advance();
        debug!(
            path = %self.path.display(),
            old_size,
            new_size,
            chunks = count,
            sequence,
            "chunked.mmap.grow"
        );
        Ok(())
    }

    fn check_range(start: u64, end: u64, address: u64, len: usize) -> Result<()> {
        let last = address.checked_add(len as u64);
        match last {
            Some(last) if address >= start && last <= end => Ok(()),
            _ => {
                error!(address, len, start, end, "chunked.mmap.out_of_range");
                Err(StoreError::OutOfRange {
                    address,
                    len,
                    start,
                    end,
                })
            }
        }
    }
}

/// Range-checked view handing its cursor back to the pool on drop.
struct MmapView<'a> {
    store: &'a MmapStoreReadWrite,
    cursor: Option<Stamped<ChunkCursor>>,
    start: u64,
    end: u64,
}

impl<'a> MmapView<'a> {
    fn new(store: &'a MmapStoreReadWrite, start: u64, end: u64) -> Self {
        Self {
            store,
            cursor: Some(store.checkout_cursor()),
            start,
            end,
        }
    }

    /// Returns a cursor whose table reaches `end`, rebuilding a stale one.
    fn cursor(&mut self, end: u64) -> &ChunkCursor {
        let store = self.store;
        let stale = self.cursor.as_ref().map_or(true, |cursor| {
            !store.cursors.is_current(cursor) && !cursor.get().table.covers(end)
        });
        if stale {
            trace!(sequence = store.sequence(), "chunked.mmap.cursor_refresh");
            self.cursor = None;
        }
        self.cursor
            .get_or_insert_with(|| store.fresh_cursor())
            .get()
    }
}

impl Drop for MmapView<'_> {
    fn drop(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            self.store.cursors.checkin(cursor);
        }
    }
}

impl InStore for MmapView<'_> {
    fn read(&mut self, address: u64, dst: &mut [u8]) -> Result<()> {
        MmapStoreReadWrite::check_range(self.start, self.end, address, dst.len())?;
        self.store.ensure_open()?;
        let end = address + dst.len() as u64;
        self.cursor(end).read(address, dst)
    }
}

impl OutStore for MmapView<'_> {
    fn write(&mut self, address: u64, src: &[u8]) -> Result<()> {
        MmapStoreReadWrite::check_range(self.start, self.end, address, src.len())?;
        self.store.ensure_open()?;
        let end = address + src.len() as u64;
        self.cursor(end).write(address, src)
    }

    fn len(&self) -> u64 {
        self.store.file_size()
    }
}

impl StoreReadWrite for MmapStoreReadWrite {
    fn create(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|err| match err.kind() {
                ErrorKind::AlreadyExists => StoreError::AlreadyExists(self.path.clone()),
                _ => StoreError::from(err),
            })?;
        self.init_impl(file)
    }

    fn init(&self) -> Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.init_impl(file)
    }

    fn open_read(&self, address: u64, size: usize) -> Result<Box<dyn InStore + '_>> {
        self.ensure_open()?;
        let end = address
            .checked_add(size as u64)
            .ok_or(StoreError::Invalid("read range overflows"))?;
        if end > self.file_size() {
            return Err(StoreError::OutOfRange {
                address,
                len: size,
                start: 0,
                end: self.file_size(),
            });
        }
        self.map_through(end)?;
        Ok(Box::new(MmapView::new(self, address, end)))
    }

    fn open_write(&self, address: u64, size: usize) -> Result<Box<dyn OutStore + '_>> {
        self.ensure_open()?;
        if size == 0 {
            return Err(StoreError::Invalid("empty write range"));
        }
        let end = address
            .checked_add(size as u64)
            .ok_or(StoreError::Invalid("write range overflows"))?;
        self.map_through(end)?;
        Ok(Box::new(MmapView::new(self, address, end)))
    }

    fn fsync(&self) -> Result<()> {
        self.ensure_open()?;
        let table = self.table();
        for chunk in &table.chunks {
            chunk.map.lock().flush()?;
        }
        trace!(path = %self.path.display(), chunks = table.chunks.len(), "chunked.mmap.fsync");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _grow = self.grow_lock.lock();
        let table = self.table();
        let mut result = Ok(());
        for chunk in &table.chunks {
            if let Err(err) = chunk.map.lock().flush() {
                error!(path = %self.path.display(), address = chunk.address, error = %err, "chunked.mmap.close_flush_failed");
                result = Err(StoreError::Io(err));
            }
        }
        if let Some(file) = self.file.write().take() {
            file.sync_all()?;
        }
        *self.chunks.write() = Arc::new(ChunkTable::empty(table.chunk_size));
        self.cursors.drain();
        self.cursors.advance();
        debug!(path = %self.path.display(), "chunked.mmap.close");
        result
    }

    fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    fn chunk_size(&self) -> u64 {
        self.chunks.read().chunk_size
    }

    fn is_mapped(&self) -> bool {
        true
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
