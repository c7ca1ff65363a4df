//! Growable, chunk-mapped byte storage for one physical file.
//!
//! The file is memory-mapped in fixed-size chunks that are only ever
//! appended. Growth replaces the chunk table wholesale, so readers holding
//! an older table keep a valid view of every range they could see before.
//! When mapping is unavailable the same contract is served by positioned
//! reads and writes ([`FileStoreReadWrite`]).

mod file;
mod geometry;
mod mmap;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::types::Result;

pub use file::FileStoreReadWrite;
pub use geometry::{align_up, chunk_size_for, extend_file_size, highest_one_bit, MIN_CHUNK_SIZE};
pub use mmap::MmapStoreReadWrite;

/// Default growth increment for store files (32 MiB).
pub const DEFAULT_FILE_SIZE_INCREMENT: u64 = 32 * 1024 * 1024;
/// Default upper bound on the mmap chunk size (256 MiB).
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 0x1000_0000;

/// Short-lived read view restricted to the range it was opened for.
pub trait InStore {
    /// Fills `dst` from the bytes starting at `address`.
    fn read(&mut self, address: u64, dst: &mut [u8]) -> Result<()>;
}

/// Short-lived write view restricted to the range it was opened for.
pub trait OutStore {
    /// Copies `src` into the file starting at `address`.
    fn write(&mut self, address: u64, src: &[u8]) -> Result<()>;
    /// Current file length.
    fn len(&self) -> u64;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Contract shared by the mapped and plain store backends.
pub trait StoreReadWrite: Send + Sync + 'static {
    /// Creates the backing file; fails if it already exists.
    fn create(&self) -> Result<()>;
    /// Opens an existing backing file and records its length.
    fn init(&self) -> Result<()>;
    /// Opens a read view over `[address, address + size)`.
    fn open_read(&self, address: u64, size: usize) -> Result<Box<dyn InStore + '_>>;
    /// Opens a write view over `[address, address + size)`, growing the file as needed.
    fn open_write(&self, address: u64, size: usize) -> Result<Box<dyn OutStore + '_>>;
    /// Forces written bytes to stable storage.
    fn fsync(&self) -> Result<()>;
    /// Syncs and releases the file. Idempotent.
    fn close(&self) -> Result<()>;
    /// Current file length in bytes.
    fn file_size(&self) -> u64;
    /// Size of the units the file grows by.
    fn chunk_size(&self) -> u64;
    /// True if this backend serves accesses through memory maps.
    fn is_mapped(&self) -> bool;
    /// Path of the backing file.
    fn path(&self) -> &Path;
}

/// Returns true when the platform supports the mapped backend.
pub fn mmap_supported() -> bool {
    cfg!(any(unix, windows)) && cfg!(target_pointer_width = "64")
}

/// Chooses and configures a store backend for one file.
#[derive(Clone, Debug)]
pub struct StoreBuilder {
    path: PathBuf,
    mmap: bool,
    file_size_increment: u64,
    max_chunk_size: u64,
}

impl StoreBuilder {
    /// Starts a builder for the file at `path` with default geometry.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            mmap: true,
            file_size_increment: DEFAULT_FILE_SIZE_INCREMENT,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }

    /// Requests (or forbids) the mapped backend.
    pub fn mmap(mut self, enabled: bool) -> Self {
        self.mmap = enabled;
        self
    }

    /// Sets the growth increment and minimum chunk size.
    pub fn file_size_increment(mut self, increment: u64) -> Self {
        self.file_size_increment = increment.max(MIN_CHUNK_SIZE);
        self
    }

    /// Sets the upper bound for the derived chunk size.
    pub fn max_chunk_size(mut self, max: u64) -> Self {
        self.max_chunk_size = max.max(MIN_CHUNK_SIZE);
        self
    }

    /// Returns true if [`build`](Self::build) will pick the mapped backend.
    pub fn uses_mmap(&self) -> bool {
        self.mmap && mmap_supported()
    }

    /// Builds the backend. The file is not touched until `create` or `init`.
    pub fn build(self) -> Arc<dyn StoreReadWrite> {
        if self.uses_mmap() {
            Arc::new(MmapStoreReadWrite::new(
                self.path,
                self.file_size_increment,
                self.max_chunk_size,
            ))
        } else {
            Arc::new(FileStoreReadWrite::new(self.path, self.file_size_increment))
        }
    }
}
