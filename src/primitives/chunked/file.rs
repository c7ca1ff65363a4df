use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use super::geometry::align_up;
use super::{InStore, OutStore, StoreReadWrite};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{Result, StoreError};

/// Store backend using positioned reads and writes; grows in whole increments.
pub struct FileStoreReadWrite {
    path: PathBuf,
    increment: u64,
    io: RwLock<Option<StdFileIo>>,
    file_size: AtomicU64,
    grow_lock: Mutex<()>,
    closed: AtomicBool,
}

impl FileStoreReadWrite {
    /// Creates an unopened store for `path`.
    pub fn new(path: PathBuf, increment: u64) -> Self {
        Self {
            path,
            increment,
            io: RwLock::new(None),
            file_size: AtomicU64::new(0),
            grow_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    fn handle(&self) -> Result<StdFileIo> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        self.io.read().clone().ok_or(StoreError::Closed)
    }

    fn install(&self, io: StdFileIo) -> Result<()> {
        let len = io.len()?;
        self.file_size.store(len, Ordering::Release);
        *self.io.write() = Some(io);
        self.closed.store(false, Ordering::Release);
        debug!(path = %self.path.display(), file_size = len, "chunked.file.init");
        Ok(())
    }

    fn grow_to(&self, io: &StdFileIo, end: u64) -> Result<()> {
        if end <= self.file_size() {
            return Ok(());
        }
        let _grow = self.grow_lock.lock();
        let old = self.file_size();
        if end <= old {
            return Ok(());
        }
        let new_size = align_up(end, self.increment);
        io.truncate(new_size)?;
        self.file_size.store(new_size, Ordering::Release);
        debug!(path = %self.path.display(), old, new_size, "chunked.file.grow");
        Ok(())
    }
}

struct FileView {
    io: StdFileIo,
    start: u64,
    end: u64,
    file_size: u64,
}

impl FileView {
    fn check(&self, address: u64, len: usize) -> Result<()> {
        match address.checked_add(len as u64) {
            Some(last) if address >= self.start && last <= self.end => Ok(()),
            _ => {
                error!(address, len, start = self.start, end = self.end, "chunked.file.out_of_range");
                Err(StoreError::OutOfRange {
                    address,
                    len,
                    start: self.start,
                    end: self.end,
                })
            }
        }
    }
}

impl InStore for FileView {
    fn read(&mut self, address: u64, dst: &mut [u8]) -> Result<()> {
        self.check(address, dst.len())?;
        self.io.read_at(address, dst)
    }
}

impl OutStore for FileView {
    fn write(&mut self, address: u64, src: &[u8]) -> Result<()> {
        self.check(address, src.len())?;
        self.io.write_at(address, src)
    }

    fn len(&self) -> u64 {
        self.file_size
    }
}

impl StoreReadWrite for FileStoreReadWrite {
    fn create(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        self.install(StdFileIo::create_new(&self.path)?)
    }

    fn init(&self) -> Result<()> {
        self.install(StdFileIo::open(&self.path)?)
    }

    fn open_read(&self, address: u64, size: usize) -> Result<Box<dyn InStore + '_>> {
        let io = self.handle()?;
        let end = address
            .checked_add(size as u64)
            .ok_or(StoreError::Invalid("read range overflows"))?;
        let file_size = self.file_size();
        if end > file_size {
            return Err(StoreError::OutOfRange {
                address,
                len: size,
                start: 0,
                end: file_size,
            });
        }
        Ok(Box::new(FileView {
            io,
            start: address,
            end,
            file_size,
        }))
    }

    fn open_write(&self, address: u64, size: usize) -> Result<Box<dyn OutStore + '_>> {
        let io = self.handle()?;
        if size == 0 {
            return Err(StoreError::Invalid("empty write range"));
        }
        let end = address
            .checked_add(size as u64)
            .ok_or(StoreError::Invalid("write range overflows"))?;
        self.grow_to(&io, end)?;
        Ok(Box::new(FileView {
            io,
            start: address,
            end,
            file_size: self.file_size(),
        }))
    }

    fn fsync(&self) -> Result<()> {
        self.handle()?.sync_all()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(io) = self.io.write().take() {
            io.sync_all()?;
        }
        debug!(path = %self.path.display(), "chunked.file.close");
        Ok(())
    }

    fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    fn chunk_size(&self) -> u64 {
        self.increment
    }

    fn is_mapped(&self) -> bool {
        false
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
