#![forbid(unsafe_code)]

//! Positioned `read`/`write` stream over a chunked store.

use std::path::Path;
use std::sync::Arc;

use tracing::trace;

use crate::primitives::chunked::{StoreBuilder, StoreReadWrite};
use crate::types::Result;

/// Stream view of one store file, addressed by absolute byte position.
#[derive(Clone)]
pub struct StoreStream {
    store: Arc<dyn StoreReadWrite>,
}

impl StoreStream {
    /// Wraps an already created or initialised store.
    pub fn new(store: Arc<dyn StoreReadWrite>) -> Self {
        Self { store }
    }

    /// Opens the existing file at `path` through `builder`.
    pub fn open(builder: StoreBuilder) -> Result<Self> {
        let store = builder.build();
        store.init()?;
        Ok(Self::new(store))
    }

    /// Reads into `buf` at `pos`, returning how many bytes were available.
    ///
    /// The count is short only when the range runs past the end of the file.
    pub fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let available = self.store.file_size().saturating_sub(pos);
        let len = buf.len().min(usize::try_from(available).unwrap_or(usize::MAX));
        if len == 0 {
            trace!(pos, want = buf.len(), "stream.read.eof");
            return Ok(0);
        }
        self.store.open_read(pos, len)?.read(pos, &mut buf[..len])?;
        Ok(len)
    }

    /// Writes all of `buf` at `pos`, growing the file when needed.
    pub fn write(&self, pos: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.store.open_write(pos, buf.len())?.write(pos, buf)
    }

    /// Grows the file so that `end` bytes are addressable.
    pub fn reserve(&self, end: u64) -> Result<()> {
        if end <= self.len() {
            return Ok(());
        }
        let last = end - 1;
        self.store.open_write(last, 1).map(drop)
    }

    /// Current file length.
    pub fn len(&self) -> u64 {
        self.store.file_size()
    }

    /// Returns true if the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forces written bytes to disk.
    pub fn fsync(&self) -> Result<()> {
        self.store.fsync()
    }

    /// Syncs and releases the file.
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }

    /// True when backed by memory maps.
    pub fn is_mapped(&self) -> bool {
        self.store.is_mapped()
    }

    /// Growth unit of the underlying store.
    pub fn chunk_size(&self) -> u64 {
        self.store.chunk_size()
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        self.store.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reads_past_end_are_short() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = StoreBuilder::new(dir.path().join("s.db"))
            .mmap(false)
            .file_size_increment(4096)
            .build();
        store.create()?;
        let stream = StoreStream::new(store);
        stream.write(4090, b"abcdef")?;
        assert_eq!(stream.len(), 8192);

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(8184, &mut buf)?, 8);
        assert_eq!(stream.read(9000, &mut buf)?, 0);
        assert_eq!(stream.read(4090, &mut buf[..6])?, 6);
        assert_eq!(&buf[..6], b"abcdef");
        Ok(())
    }
}
