//! Low-level primitives for building the storage engine.
//!
//! Includes positioned file I/O, concurrency controls, the chunked mmap
//! store, and the block cache built on top of them.

/// Growable chunk-mapped file storage.
///
/// Memory-mapped and plain backends behind one range-checked contract.
pub mod chunked;

/// Concurrency primitives and synchronization.
///
/// Counting semaphore and generation-stamped object pool.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Positioned reads and writes against plain files.
pub mod io;

/// Block cache subsystem.
///
/// Pinned blocks, the shared write-back queue, and per-store block I/O.
pub mod pager;

/// Positioned stream adapter over a chunked store.
pub mod stream;
