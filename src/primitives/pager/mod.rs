#![forbid(unsafe_code)]

//! Block cache: pinned pages, write-back queue, and per-store block I/O.

mod block;
mod manager;
mod read_write;
mod write_queue;

pub use block::{Block, BlockGuard, BlockState, BlockWrite, WriteCompletion};
pub use manager::{cache_capacity, BlockManager, BlockManagerStats, StoreIdAllocator};
pub use read_write::{BlockIoOptions, BlockReadWrite, IoCounters};
pub use write_queue::{
    BlockWriteQueue, WriteQueueStats, DEFAULT_PARK, DEFAULT_WRITE_QUEUE_CAPACITY,
};
