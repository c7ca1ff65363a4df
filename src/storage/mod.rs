//! Engine handle, store lifecycle and configuration.
//!
//! A [`StorageEngine`] owns one block cache, the write-back worker and an
//! optional periodic flusher. Stores opened through it share the cache and
//! are addressed by [`BlockStore`] handles.

mod engine;
mod options;
mod store;

pub use engine::StorageEngine;
pub use options::{default_config_path, EngineOptions};
pub use store::BlockStore;
