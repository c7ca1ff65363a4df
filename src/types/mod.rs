//! Identifiers, block geometry, and the crate-wide error type.

use std::fmt;
use std::path::PathBuf;

use crate::primitives::pager::BlockState;

/// Number of low bits of a [`BlockId`] reserved for the owning store id.
pub const STORE_ID_BITS: u32 = 16;
/// Mask selecting the store id out of a [`BlockId`].
pub const STORE_ID_MASK: u64 = (1 << STORE_ID_BITS) - 1;
/// Size of the store id space, including the reserved id 0.
pub const STORE_ID_SPACE: usize = 1 << STORE_ID_BITS;
/// Default block size shared by every store in an engine.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Small integer naming a store; valid ids are `1..=65535`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct StoreId(pub u16);

impl StoreId {
    /// Returns true unless this is the reserved id 0.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique block identifier.
///
/// The low [`STORE_ID_BITS`] bits carry the owning store id and the
/// remaining bits carry the block index within that store's file. The byte
/// address of the block is `index * block_size`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlockId(pub u64);

impl BlockId {
    /// Builds the id of block `index` inside `store`.
    pub const fn new(store: StoreId, index: u64) -> Self {
        BlockId((index << STORE_ID_BITS) | store.0 as u64)
    }

    /// Builds the id of the block containing byte `address`.
    pub const fn from_address(store: StoreId, address: u64, block_size: usize) -> Self {
        Self::new(store, address / block_size as u64)
    }

    /// Returns the store id embedded in the low bits.
    pub const fn store_id(self) -> StoreId {
        StoreId((self.0 & STORE_ID_MASK) as u16)
    }

    /// Returns the block index within its store.
    pub const fn index(self) -> u64 {
        self.0 >> STORE_ID_BITS
    }

    /// Returns the page-aligned byte address of the block in its file.
    pub const fn address(self, block_size: usize) -> u64 {
        self.index() * block_size as u64
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Errors produced by the block cache and the storage layers beneath it.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Operating-system I/O failure, propagated unchanged.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk state does not match what the engine expects.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller passed an argument the engine cannot honour.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A block id was presented to a store that does not own it.
    #[error("block {block} does not belong to store {store}")]
    StoreMismatch {
        /// Offending block id.
        block: BlockId,
        /// Store the block was requested from.
        store: StoreId,
    },
    /// A block was asked to move through an edge its state machine forbids.
    #[error("illegal block state transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// State before the request.
        from: BlockState,
        /// Requested state.
        to: BlockState,
    },
    /// Access outside the byte range a stream facade was opened for.
    #[error("access {address:#x}+{len} outside range [{start:#x}, {end:#x})")]
    OutOfRange {
        /// First byte of the access.
        address: u64,
        /// Length of the access.
        len: usize,
        /// Start of the permitted range.
        start: u64,
        /// End of the permitted range.
        end: u64,
    },
    /// `create` was asked to overwrite an existing file.
    #[error("store file already exists: {0}")]
    AlreadyExists(PathBuf),
    /// The component has been closed.
    #[error("closed")]
    Closed,
    /// A block stayed short after every retry.
    #[error("block {0} unreadable after retries")]
    UnreadableBlock(BlockId),
    /// Every store id is in use.
    #[error("store id space exhausted")]
    StoreIdsExhausted,
    /// Id 0 or an id outside the store id space.
    #[error("invalid store id {0}")]
    InvalidStoreId(u32),
    /// A store id was freed twice or never allocated.
    #[error("store id {0} is not allocated")]
    StoreIdNotAllocated(StoreId),
    /// Configuration could not be parsed or failed validation.
    #[error("config: {0}")]
    Config(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;
