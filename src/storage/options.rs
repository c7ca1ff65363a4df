use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::chunked::{
    DEFAULT_FILE_SIZE_INCREMENT, DEFAULT_MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
use crate::primitives::pager::{cache_capacity, BlockIoOptions, DEFAULT_WRITE_QUEUE_CAPACITY};
use crate::types::{Result, StoreError, DEFAULT_BLOCK_SIZE};

/// Configuration for a [`super::StorageEngine`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Size of every block in bytes; a power of two.
    pub block_size: usize,
    /// Memory the cache is sized against (an eighth is spent on blocks).
    pub max_memory_bytes: u64,
    /// Explicit cache size in blocks; overrides `max_memory_bytes`.
    pub cache_blocks: Option<usize>,
    /// Blocks the write-back queue holds before producers block.
    pub write_queue_capacity: usize,
    /// How long a producer parks between checks of a full queue.
    pub write_queue_park_ms: u64,
    /// Growth increment for store files; a power of two.
    pub file_size_increment: u64,
    /// Upper bound on the mmap chunk size.
    pub mmap_max_chunk_size: u64,
    /// Serve stores through memory maps when possible.
    pub enable_mmap: bool,
    /// Concurrent non-priority users of plain file handles per store.
    pub max_open_handles: usize,
    /// Idle plain file handles kept per store.
    pub handle_pool_size: usize,
    /// Attempts before a short block read is fatal.
    pub read_retries: u32,
    /// Period of the background flusher; `None` disables it.
    pub flush_interval_ms: Option<u64>,
    /// How long close and shutdown wait for the write-back queue to drain.
    pub close_timeout_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_memory_bytes: 1024 * 1024 * 1024,
            cache_blocks: None,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            write_queue_park_ms: 100,
            file_size_increment: DEFAULT_FILE_SIZE_INCREMENT,
            mmap_max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            enable_mmap: true,
            max_open_handles: 8,
            handle_pool_size: 4,
            read_retries: 10,
            flush_interval_ms: Some(1000),
            close_timeout_ms: 15_000,
        }
    }
}

impl EngineOptions {
    /// Parses options from TOML; missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(contents).map_err(|err| StoreError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| StoreError::Config(format!("read {}: {err}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Reads `path` if given, else the user config file if present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Serializes the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| StoreError::Config(err.to_string()))
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || !(512..=1024 * 1024).contains(&self.block_size) {
            return Err(StoreError::Config(format!(
                "block_size {} must be a power of two in 512..=1048576",
                self.block_size
            )));
        }
        if !self.file_size_increment.is_power_of_two() || self.file_size_increment < MIN_CHUNK_SIZE
        {
            return Err(StoreError::Config(format!(
                "file_size_increment {} must be a power of two >= {MIN_CHUNK_SIZE}",
                self.file_size_increment
            )));
        }
        if self.file_size_increment < self.block_size as u64 {
            return Err(StoreError::Config(
                "file_size_increment must be at least one block".into(),
            ));
        }
        if self.mmap_max_chunk_size < MIN_CHUNK_SIZE {
            return Err(StoreError::Config(format!(
                "mmap_max_chunk_size must be >= {MIN_CHUNK_SIZE}"
            )));
        }
        if self.write_queue_capacity == 0 {
            return Err(StoreError::Config("write_queue_capacity must be > 0".into()));
        }
        if self.cache_blocks == Some(0) {
            return Err(StoreError::Config("cache_blocks must be > 0".into()));
        }
        if self.max_open_handles == 0 || self.read_retries == 0 {
            return Err(StoreError::Config(
                "max_open_handles and read_retries must be > 0".into(),
            ));
        }
        if self.flush_interval_ms == Some(0) {
            return Err(StoreError::Config("flush_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Number of blocks the cache targets.
    pub fn cache_capacity(&self) -> usize {
        self.cache_blocks
            .unwrap_or_else(|| cache_capacity(self.max_memory_bytes, self.block_size))
    }

    /// Park interval for producers on a full write queue.
    pub fn write_queue_park(&self) -> Duration {
        Duration::from_millis(self.write_queue_park_ms.max(1))
    }

    /// Drain timeout used by close and shutdown.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Per-store I/O settings derived from these options.
    pub fn io_options(&self) -> BlockIoOptions {
        BlockIoOptions {
            block_size: self.block_size,
            file_size_increment: self.file_size_increment,
            mmap_max_chunk_size: self.mmap_max_chunk_size,
            enable_mmap: self.enable_mmap,
            max_open_handles: self.max_open_handles,
            handle_pool_size: self.handle_pool_size,
            read_retries: self.read_retries,
        }
    }
}

/// Location of the user-level options file, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("blockstore").join("engine.toml"))
}
