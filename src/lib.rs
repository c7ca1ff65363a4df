//! Block cache and growable memory-mapped storage.
//!
//! Stores are single files addressed in fixed-size blocks. Blocks are cached
//! in a shared LRU with pinning, written back asynchronously through a
//! bounded queue, and read from files that are mapped in append-only chunks.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use primitives::pager::{BlockGuard, BlockManagerStats, BlockState, BlockWrite};
pub use storage::{BlockStore, EngineOptions, StorageEngine};
pub use types::{BlockId, Result, StoreError, StoreId};
