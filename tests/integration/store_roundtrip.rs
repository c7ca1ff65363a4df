#![allow(missing_docs)]

use std::sync::Once;

use blockstore::primitives::chunked::mmap_supported;
use blockstore::storage::{EngineOptions, StorageEngine};
use blockstore::types::{Result, StoreError};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

const CHUNK: u64 = 64 * 1024;
const BLOCK: usize = 8192;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("blockstore=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn options(mmap: bool) -> EngineOptions {
    EngineOptions {
        block_size: BLOCK,
        file_size_increment: CHUNK,
        mmap_max_chunk_size: CHUNK,
        enable_mmap: mmap,
        cache_blocks: Some(32),
        flush_interval_ms: None,
        close_timeout_ms: 5_000,
        ..EngineOptions::default()
    }
}

fn pattern(index: u64) -> Vec<u8> {
    (0..BLOCK)
        .map(|i| (i as u64).wrapping_mul(31).wrapping_add(index * 7) as u8)
        .collect()
}

fn roundtrip(mmap: bool) -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("stores").join("roundtrip.db");
    // Blocks 0 and 7 sit in the first chunk, block 8 opens the second.
    let indices = [0u64, 7, 8];

    {
        let engine = StorageEngine::start(options(mmap))?;
        let store = engine.create_store("roundtrip", &path)?;
        for &index in &indices {
            let block = store.get_block(index)?;
            block.write().copy_from_slice(&pattern(index));
        }
        assert!(store.sync_all()?, "queue drained");
        assert!(store.file_size() >= 9 * BLOCK as u64);
        if mmap && mmap_supported() {
            assert_eq!(store.file_size() % CHUNK, 0);
        }
        store.close()?;
        engine.shutdown()?;
    }

    let engine = StorageEngine::start(options(mmap))?;
    let store = engine.open_store("roundtrip", &path)?;
    for &index in &indices {
        let block = store.get_block(index)?;
        assert_eq!(&block.read()[..], &pattern(index)[..], "block {index}");
    }
    let untouched = store.get_block(3)?;
    assert!(untouched.read().iter().all(|b| *b == 0));
    Ok(())
}

#[test]
fn roundtrip_mapped_backend() -> Result<()> {
    roundtrip(true)
}

#[test]
fn roundtrip_plain_backend() -> Result<()> {
    roundtrip(false)
}

#[test]
fn create_refuses_existing_file_and_releases_id() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("dup.db");
    let engine = StorageEngine::start(options(false))?;
    let first = engine.create_store("a", &path)?;
    let err = engine.create_store("b", &path).unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(p) if p == path));

    let second = engine.open_store("b", &path)?;
    assert_ne!(first.id(), second.id());
    second.close()?;
    first.remove()?;
    assert!(!path.exists());
    Ok(())
}

#[test]
fn reopened_store_sees_blocks_written_by_first_handle() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("shared.db");
    let engine = StorageEngine::start(options(true))?;
    let store = engine.create_store("shared", &path)?;
    store.get_block(2)?.write()[..4].copy_from_slice(b"abcd");
    store.close()?;
    assert!(matches!(store.get_block(2), Err(StoreError::Closed)));

    let reopened = engine.open_store("shared", &path)?;
    assert_eq!(&reopened.get_block(2)?.read()[..4], b"abcd");
    assert_eq!(engine.stats().queue_len, 0);
    Ok(())
}
