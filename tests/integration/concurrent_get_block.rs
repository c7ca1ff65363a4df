#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;

use blockstore::storage::{BlockStore, EngineOptions, StorageEngine};
use blockstore::types::Result;
use blockstore::BlockGuard;
use tempfile::{tempdir, TempDir};

fn engine_with_store(cache_blocks: usize) -> Result<(TempDir, StorageEngine, BlockStore)> {
    let dir = tempdir()?;
    let engine = StorageEngine::start(EngineOptions {
        block_size: 4096,
        file_size_increment: 256 * 1024,
        cache_blocks: Some(cache_blocks),
        flush_interval_ms: None,
        ..EngineOptions::default()
    })?;
    let store = engine.create_store("concurrent", dir.path().join("c.db"))?;
    Ok((dir, engine, store))
}

#[test]
fn two_callers_share_one_instance_and_one_read() -> Result<()> {
    let (_dir, engine, store) = engine_with_store(64)?;
    let barrier = Barrier::new(2);
    let guards: Vec<BlockGuard> = thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    store.get_block(42)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("thread panicked"))
            .collect::<Result<Vec<_>>>()
    })?;

    assert!(guards[0].same_block(&guards[1]));
    assert_eq!(guards[0].block().pin_count(), 2);
    let stats = engine.stats();
    assert_eq!(stats.block_reads, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.cached_blocks, 1);
    drop(guards);
    Ok(())
}

#[test]
fn many_callers_over_overlapping_ids_read_each_once() -> Result<()> {
    const THREADS: usize = 8;
    const IDS: u64 = 32;
    let (_dir, engine, store) = engine_with_store(256)?;
    let barrier = Barrier::new(THREADS);
    thread::scope(|scope| {
        for worker in 0..THREADS {
            let barrier = &barrier;
            let store = &store;
            scope.spawn(move || {
                barrier.wait();
                for step in 0..IDS {
                    let index = (step + worker as u64 * 3) % IDS;
                    let guard = store.get_block(index).expect("get_block");
                    assert_eq!(guard.id(), store.block_id(index));
                }
            });
        }
    });

    let stats = engine.stats();
    assert_eq!(stats.block_reads, IDS);
    assert_eq!(stats.misses, IDS);
    assert_eq!(stats.hits + stats.misses, (THREADS as u64) * IDS);
    assert_eq!(stats.cached_blocks, IDS as usize);
    Ok(())
}

#[test]
fn writers_and_readers_under_eviction_pressure() -> Result<()> {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 48;
    let (_dir, engine, store) = engine_with_store(16)?;
    thread::scope(|scope| {
        for worker in 0..THREADS {
            let store = &store;
            scope.spawn(move || {
                for step in 0..PER_THREAD {
                    let index = worker * PER_THREAD + step;
                    let guard = store.get_block(index).expect("get_block");
                    guard.write()[..8].copy_from_slice(&index.to_le_bytes());
                }
            });
        }
    });
    assert!(store.sync_all()?);
    assert!(engine.stats().evictions > 0);

    let mut seen = HashSet::new();
    for index in 0..THREADS * PER_THREAD {
        let guard = store.get_block(index)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&guard.read()[..8]);
        assert_eq!(u64::from_le_bytes(word), index);
        seen.insert(guard.id());
    }
    assert_eq!(seen.len() as u64, THREADS * PER_THREAD);
    Ok(())
}
