use std::collections::VecDeque;
use std::time::Instant;

use crate::cache::hash::{DigestKind, PartialHash};
use crate::disk::job::DiskJob;

use bep_util::bt::InfoHash;

/// Identity of a cached piece.
pub type PieceKey = (InfoHash, u64);

/// Which LRU list a piece entry currently lives on.
///
/// Every entry is on exactly one list. The two ghost states retain only the
/// piece identity after eviction so the cache can detect almost hits.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CacheState {
    /// Pieces with dirty blocks or hash state, waiting on flushes.
    WriteLru,
    /// Read pieces expected to be touched once.
    VolatileReadLru,
    /// Read pieces seen once, the recency side.
    ReadLru1,
    /// Evicted identities from the recency side.
    ReadLru1Ghost,
    /// Read pieces seen more than once, the frequency side.
    ReadLru2,
    /// Evicted identities from the frequency side.
    ReadLru2Ghost,
}

impl CacheState {
    /// Number of distinct states, the size of the list table.
    pub const COUNT: usize = 6;

    /// Table index of this state.
    pub fn index(self) -> usize {
        match self {
            CacheState::WriteLru => 0,
            CacheState::VolatileReadLru => 1,
            CacheState::ReadLru1 => 2,
            CacheState::ReadLru1Ghost => 3,
            CacheState::ReadLru2 => 4,
            CacheState::ReadLru2Ghost => 5,
        }
    }

    pub fn is_ghost(self) -> bool {
        match self {
            CacheState::ReadLru1Ghost | CacheState::ReadLru2Ghost => true,
            _ => false,
        }
    }

    /// Ghost list an evicted entry of this state moves to, if any.
    pub fn ghost_state(self) -> Option<CacheState> {
        match self {
            CacheState::ReadLru1 => Some(CacheState::ReadLru1Ghost),
            CacheState::ReadLru2 => Some(CacheState::ReadLru2Ghost),
            _ => None,
        }
    }
}

//----------------------------------------------------------------------------//

/// One 16 KiB slot of a cached piece.
#[derive(Default)]
pub struct BlockSlot {
    /// Buffer holding the block payload, None for an empty slot.
    pub buf: Option<Vec<u8>>,
    /// Outstanding references pinning this block.
    pub refcount: u16,
    /// Block holds data not yet written to storage.
    pub dirty: bool,
    /// I/O for this block is outstanding.
    pub pending: bool,
    /// Block was previously dirty and has since been flushed.
    pub written: bool,
    /// Slot reserved as a read placeholder, no data yet.
    pub uninitialized: bool,
}

impl BlockSlot {
    /// True if the slot holds no buffer and no reservation.
    pub fn is_free(&self) -> bool {
        self.buf.is_none() && !self.uninitialized
    }

    /// True if the block may be dropped right now.
    pub fn is_evictable(&self) -> bool {
        self.buf.is_some() && !self.dirty && !self.pending && self.refcount == 0
    }
}

//----------------------------------------------------------------------------//

/// One cached piece, resident in the cache arena.
pub struct PieceEntry {
    pub key: PieceKey,
    /// Fixed array of block slots, one per 16 KiB block of the piece.
    pub blocks: Box<[BlockSlot]>,
    /// Length of this piece in bytes, the last piece may be short.
    pub piece_len: usize,
    /// Slots currently holding a buffer.
    pub num_blocks: usize,
    /// Slots currently dirty.
    pub num_dirty: usize,
    /// Piece level pins held by in flight flush and hash plans.
    pub piece_refcount: usize,
    /// Digest algorithm for this torrent's pieces.
    pub digest_kind: DigestKind,
    pub cache_state: CacheState,
    /// A hash pass is running with the cache lock released.
    pub hashing: bool,
    /// The hash cursor has reached the end of the piece.
    pub hashing_done: bool,
    pub marked_for_deletion: bool,
    /// Flushing requires hashing blocks that were already evicted.
    pub need_readback: bool,
    /// A read covering this piece is scheduled.
    pub outstanding_read: bool,
    /// A deferred flush job is queued for this piece.
    pub outstanding_flush: bool,
    pub hash: Option<PartialHash>,
    /// Jobs waiting on I/O or hashing for this piece.
    pub jobs: VecDeque<DiskJob>,
    /// Jobs deferred because their target slot was busy.
    pub deferred: VecDeque<DiskJob>,
    /// Last touch, drives the expiry scan of the write list.
    pub last_touch: Instant,
    /// Intrusive linkage within the current LRU list.
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

impl PieceEntry {
    pub fn new(key: PieceKey, blocks_in_piece: usize, piece_len: usize, digest_kind: DigestKind, cache_state: CacheState) -> PieceEntry {
        let mut blocks = Vec::with_capacity(blocks_in_piece);
        blocks.resize_with(blocks_in_piece, BlockSlot::default);

        PieceEntry {
            key,
            blocks: blocks.into_boxed_slice(),
            piece_len,
            num_blocks: 0,
            num_dirty: 0,
            piece_refcount: 0,
            digest_kind,
            cache_state,
            hashing: false,
            hashing_done: false,
            marked_for_deletion: false,
            need_readback: false,
            outstanding_read: false,
            outstanding_flush: false,
            hash: None,
            jobs: VecDeque::new(),
            deferred: VecDeque::new(),
            last_touch: Instant::now(),
            prev: None,
            next: None,
        }
    }

    pub fn blocks_in_piece(&self) -> usize {
        self.blocks.len()
    }

    /// Sum of block refcounts plus the piece level pins.
    pub fn refcount(&self) -> usize {
        let block_refs: usize = self.blocks.iter().map(|block| block.refcount as usize).sum();

        block_refs + self.piece_refcount
    }

    /// A piece is evictable iff nothing pins it and nothing is dirty.
    pub fn is_evictable(&self) -> bool {
        self.refcount() == 0 && self.num_dirty == 0 && !self.hashing
    }

    /// Length in bytes of the given block, the final block may be short.
    pub fn block_len(&self, block: usize) -> usize {
        let begin = block * crate::BLOCK_SIZE;
        debug_assert!(begin < self.piece_len);

        std::cmp::min(crate::BLOCK_SIZE, self.piece_len - begin)
    }
}
