#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use blockstore::primitives::pager::{
    Block, BlockIoOptions, BlockReadWrite, BlockWriteQueue, IoCounters,
};
use blockstore::storage::{EngineOptions, StorageEngine};
use blockstore::types::{BlockId, Result, StoreId};
use blockstore::BlockState;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

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

/// Raises the flag when dropped, including while a failed assertion unwinds.
struct StopOnDrop<'a>(&'a AtomicBool);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[test]
fn latest_content_wins_across_repeated_flushes() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("latest.db");
    let options = EngineOptions {
        block_size: 4096,
        file_size_increment: 64 * 1024,
        cache_blocks: Some(8),
        flush_interval_ms: None,
        ..EngineOptions::default()
    };

    {
        let engine = StorageEngine::start(options.clone())?;
        let store = engine.create_store("latest", &path)?;
        for round in 0..50u8 {
            let block = store.get_block(1)?;
            block.write().fill(round);
            drop(block);
            store.flush()?;
        }
        assert!(store.sync_all()?);
    }

    let engine = StorageEngine::start(options)?;
    let store = engine.open_store("latest", &path)?;
    assert!(store.get_block(1)?.read().iter().all(|b| *b == 49));
    Ok(())
}

#[test]
fn overflowing_queue_still_persists_every_block() -> Result<()> {
    init_tracing();
    const BLOCKS: u64 = 200;
    let dir = tempdir()?;
    let path = dir.path().join("overflow.db");
    let options = EngineOptions {
        block_size: 4096,
        file_size_increment: 64 * 1024,
        cache_blocks: Some(8),
        write_queue_capacity: 4,
        write_queue_park_ms: 1,
        flush_interval_ms: None,
        ..EngineOptions::default()
    };

    {
        let engine = StorageEngine::start(options.clone())?;
        let store = engine.create_store("overflow", &path)?;
        for index in 0..BLOCKS {
            let block = store.get_block(index)?;
            block.write()[..8].copy_from_slice(&index.to_be_bytes());
        }
        assert!(store.sync_all()?);
        let queue = engine.write_queue().stats();
        assert_eq!(queue.len, 0);
        assert_eq!(queue.enqueued, queue.written);
        assert!(queue.written >= BLOCKS);
        assert!(engine.stats().evictions >= BLOCKS - 8);
    }

    let engine = StorageEngine::start(options)?;
    let store = engine.open_store("overflow", &path)?;
    for index in 0..BLOCKS {
        let block = store.get_block(index)?;
        assert_eq!(&block.read()[..8], &index.to_be_bytes()[..], "block {index}");
    }
    Ok(())
}

#[test]
fn periodic_flusher_writes_without_explicit_flush() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let engine = StorageEngine::start(EngineOptions {
        block_size: 4096,
        file_size_increment: 64 * 1024,
        cache_blocks: Some(8),
        flush_interval_ms: Some(10),
        ..EngineOptions::default()
    })?;
    let store = engine.create_store("flusher", dir.path().join("flusher.db"))?;
    store.get_block(0)?.write().fill(0x5A);

    let mut written = false;
    for _ in 0..200 {
        if engine.stats().block_writes > 0 && engine.write_queue().is_empty() {
            written = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(written, "flusher never wrote the dirty block");

    let mut disk = vec![0u8; 4096];
    store.io().read_block(store.block_id(0), &mut disk)?;
    assert!(disk.iter().all(|b| *b == 0x5A));
    Ok(())
}

#[test]
fn block_rewritten_and_evicted_during_write_keeps_latest_bytes() -> Result<()> {
    init_tracing();
    const BLOCK: usize = 256 * 1024;
    const ROUNDS: u8 = 100;
    let dir = tempdir()?;
    let engine = StorageEngine::start(EngineOptions {
        block_size: BLOCK,
        cache_blocks: Some(1),
        enable_mmap: false,
        max_open_handles: 1,
        flush_interval_ms: None,
        ..EngineOptions::default()
    })?;
    let store = engine.create_store("inflight", dir.path().join("inflight.db"))?;
    let stop = AtomicBool::new(false);

    thread::scope(|scope| -> Result<()> {
        // Competes for the only handle permit so writes stay in flight longer.
        let reader = scope.spawn(|| -> Result<()> {
            let mut buf = vec![0u8; BLOCK];
            while !stop.load(Ordering::Relaxed) {
                store.io().read_block(store.block_id(7), &mut buf)?;
                thread::sleep(Duration::from_micros(100));
            }
            Ok(())
        });
        let stopper = StopOnDrop(&stop);

        for round in 0..ROUNDS {
            let (older, newer) = (round * 2, round * 2 + 1);
            store.get_block(0)?.write().fill(older);
            store.flush()?;
            store.get_block(0)?.write().fill(newer);
            // The cache holds one block, so this evicts block 0.
            drop(store.get_block(1)?);
            assert!(engine.wait_for_writes(Duration::from_secs(10)));
            let block = store.get_block(0)?;
            let found = block.read()[0];
            assert!(
                block.read().iter().all(|b| *b == newer),
                "round {round}: expected {newer}, found {found}"
            );
        }
        drop(stopper);
        reader.join().expect("reader panicked")
    })?;

    assert!(store.sync_all()?);
    let mut disk = vec![0u8; BLOCK];
    store.io().read_block(store.block_id(0), &mut disk)?;
    assert!(disk.iter().all(|b| *b == (ROUNDS - 1) * 2 + 1));
    Ok(())
}

#[test]
fn store_closed_after_shutdown_still_writes_dirty_blocks() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("late.db");
    let options = EngineOptions {
        block_size: 4096,
        file_size_increment: 64 * 1024,
        cache_blocks: Some(8),
        flush_interval_ms: None,
        ..EngineOptions::default()
    };

    {
        let engine = StorageEngine::start(options.clone())?;
        let store = engine.create_store("late", &path)?;
        let first = store.get_block(0)?;
        let second = store.get_block(1)?;
        engine.shutdown()?;
        assert!(engine.write_queue().is_closed());

        first.write().fill(0x11);
        second.write().fill(0x22);
        drop((first, second));
        store.close()?;
    }

    let engine = StorageEngine::start(options)?;
    let store = engine.open_store("late", &path)?;
    assert!(store.get_block(0)?.read().iter().all(|b| *b == 0x11));
    assert!(store.get_block(1)?.read().iter().all(|b| *b == 0x22));
    Ok(())
}

#[test]
fn full_queue_blocks_producer_until_head_removed() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let store = StoreId(3);
    let io = BlockReadWrite::new(
        store,
        dir.path().join("full.db"),
        BlockIoOptions {
            block_size: 4096,
            file_size_increment: 64 * 1024,
            enable_mmap: false,
            ..BlockIoOptions::default()
        },
        Arc::new(IoCounters::default()),
    );
    io.create()?;
    let io = Arc::new(io);
    let block = |index: u64| -> Result<Arc<Block>> {
        let block = Arc::new(Block::new(BlockId::new(store, index), Arc::clone(&io)));
        block.ensure_loaded(|data| {
            data.fill(index as u8);
            Ok(())
        })?;
        Ok(block)
    };

    let queue = BlockWriteQueue::new(1, Duration::from_millis(5));
    let first = block(0)?;
    let second = block(1)?;
    assert!(queue.add_dirty_block(&first)?);

    let added = AtomicBool::new(false);
    thread::scope(|scope| -> Result<()> {
        let producer = scope.spawn(|| {
            let result = queue.add_dirty_block(&second);
            added.store(true, Ordering::SeqCst);
            result
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!added.load(Ordering::SeqCst), "producer ran past a full queue");
        assert_eq!(queue.len(), 1);

        let head = queue.remove_first_block().expect("head");
        assert!(Arc::ptr_eq(&head, &first));
        assert!(producer.join().expect("producer panicked")?);
        Ok(())
    })?;

    assert!(added.load(Ordering::SeqCst));
    assert_eq!(second.state(), BlockState::WriteQueued);
    assert!(Arc::ptr_eq(&queue.peek_first_block().expect("queued"), &second));
    assert_eq!(queue.stats().enqueued, 2);
    Ok(())
}
