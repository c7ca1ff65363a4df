#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use blockstore::primitives::chunked::{
    mmap_supported, MmapStoreReadWrite, StoreBuilder, StoreReadWrite, MIN_CHUNK_SIZE,
};
use blockstore::primitives::stream::StoreStream;
use blockstore::types::Result;
use tempfile::tempdir;

const CHUNK: u64 = 64 * 1024;

fn builder(dir: &Path, name: &str, mmap: bool) -> StoreBuilder {
    StoreBuilder::new(dir.join(name))
        .mmap(mmap)
        .file_size_increment(CHUNK)
        .max_chunk_size(CHUNK)
}

fn create_stream(dir: &Path, name: &str, mmap: bool) -> Result<StoreStream> {
    let store = builder(dir, name, mmap).build();
    store.create()?;
    Ok(StoreStream::new(store))
}

fn straddle(mmap: bool) -> Result<()> {
    let dir = tempdir()?;
    let stream = create_stream(dir.path(), "straddle.db", mmap)?;
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let pos = CHUNK - 1000;
    stream.write(pos, &payload)?;
    assert!(stream.len() >= pos + payload.len() as u64);

    let mut back = vec![0u8; payload.len()];
    assert_eq!(stream.read(pos, &mut back)?, payload.len());
    assert_eq!(back, payload);

    stream.fsync()?;
    stream.close()?;
    let reopened = StoreStream::open(builder(dir.path(), "straddle.db", mmap))?;
    let mut again = vec![0u8; payload.len()];
    reopened.read(pos, &mut again)?;
    assert_eq!(again, payload);
    Ok(())
}

#[test]
fn write_straddling_chunk_boundary_mapped() -> Result<()> {
    straddle(true)
}

#[test]
fn write_straddling_chunk_boundary_plain() -> Result<()> {
    straddle(false)
}

#[test]
fn builder_falls_back_when_mmap_disabled() -> Result<()> {
    let dir = tempdir()?;
    let plain = builder(dir.path(), "plain.db", false);
    assert!(!plain.uses_mmap());
    let plain = plain.build();
    plain.create()?;
    assert!(!plain.is_mapped());

    let mapped = create_stream(dir.path(), "mapped.db", true)?;
    assert_eq!(mapped.is_mapped(), mmap_supported());
    assert!(mapped.chunk_size() >= MIN_CHUNK_SIZE);
    Ok(())
}

#[test]
fn growth_keeps_earlier_ranges_readable() -> Result<()> {
    if !mmap_supported() {
        return Ok(());
    }
    let dir = tempdir()?;
    let store = Arc::new(MmapStoreReadWrite::new(dir.path().join("grow.db"), CHUNK, CHUNK));
    store.create()?;
    let stream = StoreStream::new(Arc::clone(&store) as Arc<dyn StoreReadWrite>);
    stream.write(0, b"first chunk")?;
    let before = store.sequence();
    let chunks_before = store.mapped_chunks();

    let far = 16 * CHUNK + 17;
    stream.write(far, b"far away")?;
    assert!(store.sequence() > before);
    assert!(store.mapped_chunks() > chunks_before);

    let mut head = [0u8; 11];
    stream.read(0, &mut head)?;
    assert_eq!(&head, b"first chunk");
    let mut tail = [0u8; 8];
    stream.read(far, &mut tail)?;
    assert_eq!(&tail, b"far away");

    let mut gap = [0xFFu8; 64];
    stream.read(4 * CHUNK, &mut gap)?;
    assert!(gap.iter().all(|b| *b == 0));
    Ok(())
}

#[test]
fn read_past_end_is_short() -> Result<()> {
    let dir = tempdir()?;
    let stream = create_stream(dir.path(), "short.db", false)?;
    stream.write(0, &[1u8; 100])?;
    let len = stream.len();
    assert!(len >= 100);
    let mut buf = [0u8; 32];
    assert_eq!(stream.read(len, &mut buf)?, 0);
    assert_eq!(stream.read(len - 8, &mut buf)?, 8);
    Ok(())
}
