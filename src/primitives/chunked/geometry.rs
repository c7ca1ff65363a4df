/// Smallest chunk the store will map; keeps chunk offsets page aligned.
pub const MIN_CHUNK_SIZE: u64 = 4096;

/// Highest set bit of `value`, or 0 for 0.
pub fn highest_one_bit(value: u64) -> u64 {
    if value == 0 {
        0
    } else {
        1 << (63 - value.leading_zeros())
    }
}

/// Rounds `value` up to a multiple of `unit`.
pub fn align_up(value: u64, unit: u64) -> u64 {
    match value % unit {
        0 => value,
        rem => value + (unit - rem),
    }
}

/// Chunk size for a file that is `file_size` bytes long when first opened.
///
/// An eighth of the highest set bit of the size, capped at `max_chunk` and
/// never below `increment`.
pub fn chunk_size_for(file_size: u64, increment: u64, max_chunk: u64) -> u64 {
    let chunk = (highest_one_bit(file_size) >> 3).min(max_chunk);
    chunk.max(increment).max(MIN_CHUNK_SIZE)
}

/// New file length needed to hold `requested` bytes.
///
/// Returns `old` unchanged when it already suffices. Otherwise grows
/// geometrically to `5/4 * old + increment`, trimmed to an eighth of its
/// magnitude, never below `requested`, and rounded up to `chunk`.
pub fn extend_file_size(old: u64, requested: u64, increment: u64, chunk: u64) -> u64 {
    if requested <= old {
        return old;
    }
    let grown = old.saturating_add(old / 4).saturating_add(increment);
    let granule = (highest_one_bit(grown) >> 3).max(1);
    let trimmed = grown - grown % granule;
    align_up(trimmed.max(requested), chunk)
}
