use std::cmp;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::hash::{DigestKind, PartialHash, PieceHash};
use crate::cache::lru::{LruList, PieceArena};
use crate::cache::piece::{CacheState, PieceEntry, PieceKey};
use crate::disk::job::DiskJob;
use crate::disk::ODiskMessage;
use crate::error::{BlockError, BlockErrorKind};
use crate::memory::block::BlockMetadata;
use crate::memory::buffer_pool::BufferPool;
use crate::settings::DiskSettings;
use crate::stats::DiskStats;
use crate::BLOCK_SIZE;

pub mod hash;
pub mod lru;
pub mod piece;

/// Most recent operation that affected the ARC balance.
///
/// A hit on a ghost list records which side was starved so the next round
/// of eviction pressure removes from the other side, effectively growing
/// the side that just produced a phantom hit.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum LastCacheOp {
    Insert,
    GhostHitLru1,
    GhostHitLru2,
}

/// Outcome of a cache read attempt.
pub enum CacheRead {
    /// Bytes were copied into the caller's buffer.
    Copied(usize),
    /// The exact block was pinned instead of copied.
    ///
    /// The buffer stays valid until the handle is given back through
    /// `release_block`.
    Pinned(BlockHandle, usize),
    /// One or more blocks of the requested range are not cached.
    Miss,
}

/// Reference to a pinned block, handed out by `try_read`.
#[derive(Debug)]
pub struct BlockHandle {
    index: usize,
    block: usize,
}

/// Outcome of inserting a dirty block.
pub enum AddDirty {
    /// Block attached, job parked on the piece until its flush completes.
    Queued,
    /// Target slot is busy, job parked on the piece's deferred queue.
    Deferred,
    /// No cache memory available, caller falls back to direct I/O.
    NoMemory(DiskJob),
}

/// Outcome of reserving read placeholders.
pub enum AllocatePending {
    /// Placeholders reserved, read into the plan's buffers.
    Read(ReadPlan),
    /// Every block of the range is already resident.
    Nothing,
    /// Insufficient room even after eviction, read directly from disk.
    NoRoom,
}

/// Reserved read: buffers to fill outside the cache lock.
pub struct ReadPlan {
    pub index: usize,
    pub key: PieceKey,
    pub begin: usize,
    pub end: usize,
    /// One buffer per block in [begin, end), in order.
    pub buffers: Vec<Vec<u8>>,
}

/// A contiguous run of dirty blocks to write outside the cache lock.
pub struct FlushPlan {
    pub index: usize,
    pub key: PieceKey,
    pub begin: usize,
    pub end: usize,
    /// Copies of the dirty payloads, trimmed to their block lengths.
    pub buffers: Vec<Vec<u8>>,
}

/// A run of resident blocks to digest outside the cache lock.
pub struct HashPlan {
    pub index: usize,
    pub key: PieceKey,
    pub begin: usize,
    pub end: usize,
    pub hash: PartialHash,
    pub buffers: Vec<Vec<u8>>,
}

/// Outcome of trying to advance a piece's hash cursor.
pub enum KickHash {
    /// Blocks locked, digest them and call `complete_hash`.
    Plan(HashPlan),
    /// Another hash pass is in flight, retry the job later.
    Busy,
    /// The cursor already reached the end of the piece.
    Done(PieceHash),
    /// The next block is not resident, a read back is required.
    Blocked,
}

//----------------------------------------------------------------------------//

/// ARC style block cache over torrent pieces.
///
/// Four read lists (recency, frequency, and one ghost list for each) plus a
/// write list and a volatile read list. Pieces live in an arena addressed by
/// stable indices; list linkage is intrusive. All methods expect the caller
/// to hold the single cache mutex; plans returned by the flush/hash/read
/// methods carry everything needed to perform the I/O with the lock
/// released.
pub struct BlockCache {
    settings: DiskSettings,
    pool: Arc<BufferPool>,
    stats: Arc<DiskStats>,
    arena: PieceArena,
    free_slots: Vec<usize>,
    map: HashMap<PieceKey, usize>,
    lists: [LruList; CacheState::COUNT],
    last_cache_op: LastCacheOp,
    read_blocks: usize,
    write_blocks: usize,
    pinned_blocks: usize,
}

impl BlockCache {
    pub fn new(settings: DiskSettings, pool: Arc<BufferPool>, stats: Arc<DiskStats>) -> BlockCache {
        BlockCache {
            settings,
            pool,
            stats,
            arena: Vec::new(),
            free_slots: Vec::new(),
            map: HashMap::new(),
            lists: Default::default(),
            last_cache_op: LastCacheOp::Insert,
            read_blocks: 0,
            write_blocks: 0,
            pinned_blocks: 0,
        }
    }

    fn entry(&self, index: usize) -> &PieceEntry {
        self.arena[index].as_ref().expect("bep_disk: BlockCache Missing Arena Entry")
    }

    fn entry_mut(&mut self, index: usize) -> &mut PieceEntry {
        self.arena[index].as_mut().expect("bep_disk: BlockCache Missing Arena Entry")
    }

    /// Arena index of the piece, if it is resident or a ghost.
    pub fn find_piece(&self, key: &PieceKey) -> Option<usize> {
        self.map.get(key).copied()
    }

    /// Number of blocks currently pinned by outstanding references.
    pub fn pinned_blocks(&self) -> usize {
        self.pinned_blocks
    }

    /// True if the piece still has dirty blocks, parked jobs, or pins.
    ///
    /// A fence counts this as outstanding write work for its storage.
    pub fn piece_has_work(&self, index: usize) -> bool {
        let entry = self.entry(index);

        entry.num_dirty > 0 || !entry.jobs.is_empty() || !entry.deferred.is_empty() || entry.piece_refcount > 0
    }

    /// Arena indices of every piece belonging to the given storage.
    pub fn storage_pieces(&self, hash: &bep_util::bt::InfoHash) -> Vec<usize> {
        self.map
            .iter()
            .filter(|(key, _)| key.0 == *hash)
            .map(|(_, index)| *index)
            .collect()
    }

    //------------------------------------------------------------------------//

    /// Find or create the entry for the given piece.
    ///
    /// A hit on an existing entry, ghost entries included, promotes it in
    /// the ARC machine. A ghost hit re materializes the entry and records
    /// which side was starved.
    pub fn allocate_piece(
        &mut self,
        key: PieceKey,
        blocks_in_piece: usize,
        piece_len: usize,
        digest_kind: DigestKind,
        desired: CacheState,
    ) -> usize {
        debug_assert!(!desired.is_ghost());

        if let Some(index) = self.find_piece(&key) {
            self.touch_piece(index);

            // Only move the state downwards: ghost to resident, read to write.
            let state = self.entry(index).cache_state;
            if desired == CacheState::WriteLru && state != CacheState::WriteLru {
                self.set_state(index, CacheState::WriteLru);
            }

            return index;
        }

        let entry = PieceEntry::new(key, blocks_in_piece, piece_len, digest_kind, desired);
        let index = match self.free_slots.pop() {
            Some(slot) => {
                self.arena[slot] = Some(entry);
                slot
            }
            None => {
                self.arena.push(Some(entry));
                self.arena.len() - 1
            }
        };

        self.map.insert(key, index);
        self.lists[desired.index()].push_back(&mut self.arena, index);
        if desired != CacheState::WriteLru {
            self.last_cache_op = LastCacheOp::Insert;
        }
        self.sync_list_gauges();

        index
    }

    /// Record a hit on the piece, promoting it in the ARC machine.
    fn touch_piece(&mut self, index: usize) {
        self.entry_mut(index).last_touch = Instant::now();

        let state = self.entry(index).cache_state;
        match state {
            CacheState::ReadLru1Ghost => {
                self.last_cache_op = LastCacheOp::GhostHitLru1;
                self.set_state(index, CacheState::ReadLru2);
            }
            CacheState::ReadLru2Ghost => {
                self.last_cache_op = LastCacheOp::GhostHitLru2;
                self.set_state(index, CacheState::ReadLru2);
            }
            CacheState::ReadLru1 | CacheState::ReadLru2 => {
                self.set_state(index, CacheState::ReadLru2);
            }
            CacheState::WriteLru => {
                // Bump within the write list, flush order stays oldest first.
                self.lists[state.index()].remove(&mut self.arena, index);
                self.lists[state.index()].push_back(&mut self.arena, index);
            }
            CacheState::VolatileReadLru => {}
        }
    }

    /// Move the piece to the tail of the given list.
    fn set_state(&mut self, index: usize, new_state: CacheState) {
        let old_state = self.entry(index).cache_state;
        if old_state == new_state {
            self.lists[old_state.index()].remove(&mut self.arena, index);
            self.lists[old_state.index()].push_back(&mut self.arena, index);
            return;
        }

        self.lists[old_state.index()].remove(&mut self.arena, index);
        self.entry_mut(index).cache_state = new_state;
        self.lists[new_state.index()].push_back(&mut self.arena, index);
        self.sync_list_gauges();
    }

    fn sync_list_gauges(&self) {
        use std::sync::atomic::Ordering;

        self.stats.arc_write_size.store(self.lists[CacheState::WriteLru.index()].len(), Ordering::Relaxed);
        self.stats.arc_volatile_size.store(self.lists[CacheState::VolatileReadLru.index()].len(), Ordering::Relaxed);
        self.stats.arc_mru_size.store(self.lists[CacheState::ReadLru1.index()].len(), Ordering::Relaxed);
        self.stats.arc_mru_ghost_size.store(self.lists[CacheState::ReadLru1Ghost.index()].len(), Ordering::Relaxed);
        self.stats.arc_mfu_size.store(self.lists[CacheState::ReadLru2.index()].len(), Ordering::Relaxed);
        self.stats.arc_mfu_ghost_size.store(self.lists[CacheState::ReadLru2Ghost.index()].len(), Ordering::Relaxed);
    }

    fn sync_block_gauges(&self) {
        use std::sync::atomic::Ordering;

        self.stats.read_cache_blocks.store(self.read_blocks, Ordering::Relaxed);
        self.stats.write_cache_blocks.store(self.write_blocks, Ordering::Relaxed);
        self.stats.pinned_blocks.store(self.pinned_blocks, Ordering::Relaxed);
    }

    /// Park a job on the piece, completed by a later cache event.
    pub fn park_job(&mut self, index: usize, job: DiskJob) {
        self.entry_mut(index).jobs.push_back(job);
    }

    /// Pull every parked hash job off the piece.
    pub fn take_hash_jobs(&mut self, index: usize) -> Vec<DiskJob> {
        let parked = std::mem::replace(&mut self.entry_mut(index).jobs, Default::default());
        let mut hash_jobs = Vec::new();

        for job in parked {
            match job {
                DiskJob::HashPiece { .. } => hash_jobs.push(job),
                other => self.entry_mut(index).jobs.push_back(other),
            }
        }

        hash_jobs
    }

    /// True while a hash pass runs with the lock released.
    pub fn is_hashing(&self, index: usize) -> bool {
        self.entry(index).hashing
    }

    /// Mark that a deferred flush job has been queued for the piece.
    ///
    /// Returns false if one is already outstanding.
    pub fn schedule_flush(&mut self, index: usize) -> bool {
        let entry = self.entry_mut(index);
        if entry.outstanding_flush {
            false
        } else {
            entry.outstanding_flush = true;
            true
        }
    }

    /// Record that the deferred flush job for the piece has run.
    pub fn clear_outstanding_flush(&mut self, index: usize) {
        if self.arena[index].is_some() {
            self.entry_mut(index).outstanding_flush = false;
        }
    }

    //------------------------------------------------------------------------//

    /// Attempt to satisfy a read from the cache.
    ///
    /// On a block aligned hit of exactly one block without the force copy
    /// flag, the block is pinned and a handle is returned instead of a copy.
    pub fn try_read(&mut self, metadata: &BlockMetadata, force_copy: bool, out: &mut [u8]) -> CacheRead {
        use std::sync::atomic::Ordering;

        let key = (*metadata.info_hash(), metadata.piece_index());
        let index = match self.find_piece(&key) {
            Some(index) if !self.entry(index).cache_state.is_ghost() => index,
            _ => {
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                return CacheRead::Miss;
            }
        };

        let offset = metadata.block_offset() as usize;
        let length = metadata.block_length();
        let begin_block = offset / BLOCK_SIZE;
        let end_block = (offset + length + BLOCK_SIZE - 1) / BLOCK_SIZE;

        {
            let entry = self.entry(index);
            if end_block > entry.blocks_in_piece()
                || entry.blocks[begin_block..end_block].iter().any(|block| block.buf.is_none())
            {
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                return CacheRead::Miss;
            }
        }

        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.touch_piece(index);

        let single_block = begin_block + 1 == end_block && offset % BLOCK_SIZE == 0;
        if single_block && !force_copy && length == self.entry(index).block_len(begin_block) {
            let was_unpinned = {
                let block = &mut self.entry_mut(index).blocks[begin_block];
                let was_unpinned = block.refcount == 0;
                block.refcount += 1;

                was_unpinned
            };
            if was_unpinned {
                self.pinned_blocks += 1;
            }
            self.sync_block_gauges();

            return CacheRead::Pinned(BlockHandle { index, block: begin_block }, length);
        }

        debug_assert!(out.len() >= length);
        let mut copied = 0;
        for block in begin_block..end_block {
            let block_begin = block * BLOCK_SIZE;
            let copy_begin = cmp::max(offset, block_begin);
            let copy_end = cmp::min(offset + length, block_begin + self.entry(index).block_len(block));

            let buf = self.entry(index).blocks[block].buf.as_ref().unwrap();
            out[copied..copied + (copy_end - copy_begin)]
                .copy_from_slice(&buf[copy_begin - block_begin..copy_end - block_begin]);
            copied += copy_end - copy_begin;
        }

        CacheRead::Copied(copied)
    }

    /// Borrow the payload of a pinned block.
    pub fn with_pinned<C, R>(&self, handle: &BlockHandle, call: C) -> R
    where
        C: FnOnce(&[u8]) -> R,
    {
        let entry = self.entry(handle.index);
        let length = entry.block_len(handle.block);
        let buf = entry.blocks[handle.block]
            .buf
            .as_ref()
            .expect("bep_disk: BlockCache::with_pinned Pinned Block Missing Buffer");

        call(&buf[..length])
    }

    /// Give back a reference handed out by `try_read`.
    ///
    /// Volatile read blocks are discarded as soon as their last reference
    /// is dropped.
    pub fn release_block(&mut self, handle: BlockHandle) {
        let BlockHandle { index, block } = handle;

        let now_unpinned = {
            let slot = &mut self.entry_mut(index).blocks[block];
            debug_assert!(slot.refcount > 0);
            slot.refcount -= 1;

            slot.refcount == 0
        };
        if now_unpinned {
            self.pinned_blocks -= 1;
        }

        if now_unpinned && self.entry(index).cache_state == CacheState::VolatileReadLru {
            self.drop_block(index, block);

            if self.entry(index).num_blocks == 0 && self.entry(index).refcount() == 0 {
                self.remove_piece(index);
            }
        } else if self.entry(index).marked_for_deletion && self.entry(index).refcount() == 0 {
            self.remove_piece(index);
        }
        self.sync_block_gauges();
    }

    /// Free the buffer of a single resident block.
    fn drop_block(&mut self, index: usize, block: usize) {
        let (buf, was_dirty) = {
            let slot = &mut self.entry_mut(index).blocks[block];
            debug_assert!(slot.refcount == 0 && !slot.pending);
            let was_dirty = slot.dirty;

            slot.dirty = false;
            slot.written = false;
            slot.uninitialized = false;

            (slot.buf.take(), was_dirty)
        };

        if let Some(buf) = buf {
            self.pool.free(buf);
            self.entry_mut(index).num_blocks -= 1;
            if was_dirty {
                self.entry_mut(index).num_dirty -= 1;
                self.write_blocks -= 1;
            } else {
                self.read_blocks -= 1;
            }
        }
    }

    //------------------------------------------------------------------------//

    /// Take ownership of a write job's buffer and attach it to the cache.
    ///
    /// The job is parked on the piece and completed once the block has been
    /// flushed. If the target slot is pinned or mid I/O the job is deferred
    /// instead; if no buffer can be had even after eviction the job is
    /// handed back for uncached direct I/O.
    pub fn add_dirty_block(&mut self, job: DiskJob, blocks_in_piece: usize, piece_len: usize, digest_kind: DigestKind) -> AddDirty {
        let metadata = match &job {
            DiskJob::ProcessBlock { block, .. } => *block.metadata(),
            _ => panic!("bep_disk: BlockCache::add_dirty_block Expected A ProcessBlock Job"),
        };
        debug_assert_eq!(0, metadata.block_offset() as usize % BLOCK_SIZE);

        let key = (*metadata.info_hash(), metadata.piece_index());
        let index = self.allocate_piece(key, blocks_in_piece, piece_len, digest_kind, CacheState::WriteLru);
        let block = metadata.block_offset() as usize / BLOCK_SIZE;

        let occupied_busy = {
            let slot = &self.entry(index).blocks[block];
            slot.buf.is_some() && (slot.pending || slot.refcount > 0)
        };
        if occupied_busy {
            self.entry_mut(index).deferred.push_back(job);
            return AddDirty::Deferred;
        }

        // An idle occupant is simply replaced.
        if self.entry(index).blocks[block].buf.is_some() {
            self.drop_block(index, block);
        }

        let mut buf = match self.alloc_with_eviction(Some(index)) {
            Some(buf) => buf,
            None => {
                self.drop_if_empty(index);
                return AddDirty::NoMemory(job);
            }
        };

        {
            let payload: &[u8] = match &job {
                DiskJob::ProcessBlock { block, .. } => &*block,
                _ => unreachable!(),
            };
            buf[..payload.len()].copy_from_slice(payload);
        }

        {
            let entry = self.entry_mut(index);
            let slot = &mut entry.blocks[block];
            slot.buf = Some(buf);
            slot.dirty = true;
            slot.written = false;
            slot.uninitialized = false;

            entry.num_blocks += 1;
            entry.num_dirty += 1;
            entry.jobs.push_back(job);
        }
        self.write_blocks += 1;
        self.sync_block_gauges();

        AddDirty::Queued
    }

    /// Allocate a pool buffer, evicting clean blocks if the pool is full.
    fn alloc_with_eviction(&mut self, ignore: Option<usize>) -> Option<Vec<u8>> {
        if let Some(buf) = self.pool.alloc() {
            return Some(buf);
        }

        self.try_evict_blocks(1, ignore);
        self.pool.alloc()
    }

    /// Reserve placeholders for the missing blocks of [begin, end).
    ///
    /// Buffers for the missing blocks are checked out up front so capacity
    /// is enforced here; the caller fills them with the lock released and
    /// installs them through `mark_read_done`.
    pub fn allocate_pending(&mut self, index: usize, begin: usize, end: usize) -> AllocatePending {
        debug_assert!(end <= self.entry(index).blocks_in_piece());

        let missing: Vec<usize> = (begin..end)
            .filter(|&block| self.entry(index).blocks[block].is_free())
            .collect();
        if missing.is_empty() {
            return AllocatePending::Nothing;
        }

        // Trim to the contiguous run of missing blocks starting at the first.
        let run_begin = missing[0];
        let mut run_end = run_begin;
        for &block in missing.iter() {
            if block == run_end {
                run_end += 1;
            } else {
                break;
            }
        }

        let mut buffers = Vec::with_capacity(run_end - run_begin);
        for _ in run_begin..run_end {
            match self.alloc_with_eviction(Some(index)) {
                Some(buf) => buffers.push(buf),
                None => {
                    for buf in buffers {
                        self.pool.free(buf);
                    }
                    self.drop_if_empty(index);
                    return AllocatePending::NoRoom;
                }
            }
        }

        {
            let entry = self.entry_mut(index);
            for block in run_begin..run_end {
                let slot = &mut entry.blocks[block];
                slot.uninitialized = true;
                slot.pending = true;
            }
            entry.outstanding_read = true;
            entry.piece_refcount += 1;
        }

        let key = self.entry(index).key;
        AllocatePending::Read(ReadPlan { index, key, begin: run_begin, end: run_end, buffers })
    }

    /// Install the results of a completed read plan.
    ///
    /// On success the buffers become resident read blocks and any parked
    /// jobs that are now completable are reaped. On error the placeholders
    /// are cleared and every job queued on the piece is failed.
    pub fn mark_read_done(
        &mut self,
        plan: ReadPlan,
        result: Result<(), std::io::Error>,
        completions: &mut Vec<ODiskMessage>,
        requeue: &mut Vec<DiskJob>,
    ) {
        let ReadPlan { index, key: _, begin, end, buffers } = plan;

        match result {
            Ok(()) => {
                use std::sync::atomic::Ordering;

                {
                    let entry = self.entry_mut(index);
                    for (block, buf) in (begin..end).zip(buffers.into_iter()) {
                        let slot = &mut entry.blocks[block];
                        debug_assert!(slot.uninitialized && slot.pending);

                        slot.buf = Some(buf);
                        slot.uninitialized = false;
                        slot.pending = false;
                        entry.num_blocks += 1;
                    }
                    entry.outstanding_read = false;
                    entry.piece_refcount -= 1;
                }
                self.read_blocks += end - begin;
                self.stats.blocks_read.fetch_add(end - begin, Ordering::Relaxed);

                self.reap_piece_jobs(index, completions, requeue);
            }
            Err(err) => {
                {
                    let entry = self.entry_mut(index);
                    for block in begin..end {
                        let slot = &mut entry.blocks[block];
                        slot.uninitialized = false;
                        slot.pending = false;
                    }
                    entry.outstanding_read = false;
                    entry.piece_refcount -= 1;
                }
                for buf in buffers {
                    self.pool.free(buf);
                }

                self.fail_piece_jobs(index, &err.to_string(), completions);
            }
        }

        if self.arena[index].is_some() {
            requeue.extend(self.entry_mut(index).deferred.drain(..));
        }
        self.maybe_free_piece(index);
        self.sync_block_gauges();
    }

    /// Complete any parked jobs whose data is now resident.
    ///
    /// Parked hash jobs are requeued instead so a worker can continue the
    /// hash pass against the freshly read blocks.
    fn reap_piece_jobs(&mut self, index: usize, completions: &mut Vec<ODiskMessage>, requeue: &mut Vec<DiskJob>) {
        let parked = std::mem::replace(&mut self.entry_mut(index).jobs, Default::default());

        for job in parked {
            match job {
                DiskJob::LoadBlock { mut block, flags } => {
                    let metadata = *block.metadata();
                    match self.try_read(&metadata, true, &mut block[..]) {
                        CacheRead::Copied(_) => completions.push(ODiskMessage::BlockLoaded(block)),
                        _ => self.entry_mut(index).jobs.push_back(DiskJob::LoadBlock { block, flags }),
                    }
                }
                DiskJob::HashPiece { hash, piece } => requeue.push(DiskJob::HashPiece { hash, piece }),
                other => self.entry_mut(index).jobs.push_back(other),
            }
        }
    }

    /// Fail every job queued on the piece with the given I/O error text.
    fn fail_piece_jobs(&mut self, index: usize, error: &str, completions: &mut Vec<ODiskMessage>) {
        let entry = self.entry_mut(index);
        let parked: Vec<DiskJob> = entry.jobs.drain(..).chain(entry.deferred.drain(..)).collect();

        for job in parked {
            match job {
                DiskJob::LoadBlock { block, .. } => completions.push(ODiskMessage::LoadBlockError(
                    block,
                    BlockError::from_kind(BlockErrorKind::Msg(error.to_string())),
                )),
                DiskJob::ProcessBlock { block, .. } => completions.push(ODiskMessage::ProcessBlockError(
                    block,
                    BlockError::from_kind(BlockErrorKind::Msg(error.to_string())),
                )),
                other => {
                    if let Some(msg) = other.into_aborted() {
                        completions.push(msg);
                    }
                }
            }
        }
    }

    //------------------------------------------------------------------------//

    /// Plan a flush of the hashed dirty prefix of a piece.
    ///
    /// Flushes only up to the hash cursor, and only when at least
    /// `cont_block` contiguous dirty blocks are available, the piece is
    /// entirely dirty and hashed, or a read back is already required.
    pub fn try_flush_hashed(&mut self, index: usize, cont_block: usize) -> Option<FlushPlan> {
        if self.entry(index).piece_refcount > 0 {
            return None;
        }

        let (run_begin, run_end) = {
            let entry = self.entry(index);

            let cursor_block = if entry.hashing_done {
                entry.blocks_in_piece()
            } else {
                entry.hash.as_ref().map(|hash| hash.cursor() / BLOCK_SIZE).unwrap_or(0)
            };

            let mut run_begin = None;
            let mut run_end = 0;
            for block in 0..cursor_block {
                let slot = &entry.blocks[block];
                if slot.dirty && !slot.pending {
                    if run_begin.is_none() {
                        run_begin = Some(block);
                        run_end = block;
                    }
                    if block == run_end {
                        run_end = block + 1;
                    } else {
                        break;
                    }
                } else if run_begin.is_some() {
                    break;
                }
            }

            let run_begin = run_begin?;
            let run_len = run_end - run_begin;

            let all_dirty_hashed = entry.num_dirty == entry.blocks_in_piece() && entry.hashing_done;
            if run_len < cont_block && !all_dirty_hashed && !entry.need_readback {
                return None;
            }

            (run_begin, run_end)
        };

        Some(self.plan_flush_run(index, run_begin, run_end))
    }

    /// Plan a flush spanning several adjacent pieces.
    ///
    /// Used when the contiguity requirement exceeds a single piece. Every
    /// piece in the stripe must be fully dirty and fully hashed, otherwise
    /// only the current piece is considered through `try_flush_hashed`.
    pub fn try_flush_stripe(&mut self, index: usize, cont_block: usize) -> Vec<FlushPlan> {
        let (hash, piece) = self.entry(index).key;

        let fully_flushable = |cache: &BlockCache, idx: usize| {
            let entry = cache.entry(idx);
            entry.piece_refcount == 0
                && entry.hashing_done
                && entry.num_dirty == entry.blocks_in_piece()
        };

        if !fully_flushable(self, index) {
            return self.try_flush_hashed(index, cont_block).into_iter().collect();
        }

        // Grow the stripe downwards then upwards over adjacent pieces.
        let mut first = piece;
        while first > 0 {
            match self.find_piece(&(hash, first - 1)) {
                Some(idx) if fully_flushable(self, idx) => first -= 1,
                _ => break,
            }
        }
        let mut last = piece;
        while let Some(idx) = self.find_piece(&(hash, last + 1)) {
            if fully_flushable(self, idx) {
                last += 1;
            } else {
                break;
            }
        }

        let mut stripe_blocks = 0;
        for piece_index in first..=last {
            let idx = self.find_piece(&(hash, piece_index)).unwrap();
            stripe_blocks += self.entry(idx).blocks_in_piece();
        }
        if stripe_blocks < cont_block {
            // Stripe fell short, only the current piece is flushed.
            return self.try_flush_hashed(index, cont_block).into_iter().collect();
        }

        let mut plans = Vec::new();
        for piece_index in first..=last {
            let idx = self.find_piece(&(hash, piece_index)).unwrap();
            plans.extend(self.collect_flush_plans(idx));
        }

        plans
    }

    /// Plan flushes for every dirty block of a piece, cursor ignored.
    pub fn collect_flush_plans(&mut self, index: usize) -> Vec<FlushPlan> {
        let runs = {
            let entry = self.entry(index);
            let mut runs: Vec<(usize, usize)> = Vec::new();

            for block in 0..entry.blocks_in_piece() {
                let slot = &entry.blocks[block];
                if slot.dirty && !slot.pending {
                    match runs.last_mut() {
                        Some((_, end)) if *end == block => *end = block + 1,
                        _ => runs.push((block, block + 1)),
                    }
                }
            }

            runs
        };

        runs.into_iter().map(|(begin, end)| self.plan_flush_run(index, begin, end)).collect()
    }

    fn plan_flush_run(&mut self, index: usize, begin: usize, end: usize) -> FlushPlan {
        let key = self.entry(index).key;
        let mut buffers = Vec::with_capacity(end - begin);

        {
            let entry = self.entry_mut(index);
            for block in begin..end {
                let length = cmp::min(BLOCK_SIZE, entry.piece_len - block * BLOCK_SIZE);
                let slot = &mut entry.blocks[block];
                debug_assert!(slot.dirty && !slot.pending);

                slot.pending = true;
                buffers.push(slot.buf.as_ref().unwrap()[..length].to_vec());
            }
            entry.piece_refcount += 1;
        }

        FlushPlan { index, key, begin, end, buffers }
    }

    /// Record the outcome of a flush plan.
    ///
    /// Successful blocks move from the dirty pool to the clean pool; once
    /// the last dirty block of a write piece is gone the piece joins the
    /// read machine. Failed blocks are cleared so they are not retried
    /// forever, and every job queued on the piece is failed.
    pub fn mark_flush_done(
        &mut self,
        plan: &FlushPlan,
        result: Result<(), std::io::Error>,
        completions: &mut Vec<ODiskMessage>,
        requeue: &mut Vec<DiskJob>,
    ) {
        use std::sync::atomic::Ordering;

        let (index, begin, end) = (plan.index, plan.begin, plan.end);

        match result {
            Ok(()) => {
                {
                    let entry = self.entry_mut(index);
                    for block in begin..end {
                        let slot = &mut entry.blocks[block];
                        debug_assert!(slot.dirty && slot.pending);

                        slot.pending = false;
                        slot.dirty = false;
                        slot.written = true;
                        entry.num_dirty -= 1;
                    }
                    entry.piece_refcount -= 1;
                }
                self.write_blocks -= end - begin;
                self.read_blocks += end - begin;
                self.stats.blocks_written.fetch_add(end - begin, Ordering::Relaxed);

                // Complete the write jobs whose block is now on disk.
                let parked = std::mem::replace(&mut self.entry_mut(index).jobs, Default::default());
                for job in parked {
                    match job {
                        DiskJob::ProcessBlock { block, .. }
                            if block_index_of(&block) >= begin && block_index_of(&block) < end =>
                        {
                            completions.push(ODiskMessage::BlockProcessed(block));
                        }
                        other => self.entry_mut(index).jobs.push_back(other),
                    }
                }

                if self.entry(index).num_dirty == 0 && self.entry(index).cache_state == CacheState::WriteLru {
                    self.set_state(index, CacheState::ReadLru1);
                }
            }
            Err(err) => {
                {
                    let entry = self.entry_mut(index);
                    for block in begin..end {
                        entry.blocks[block].pending = false;
                    }
                    entry.piece_refcount -= 1;
                }
                // Clear the affected dirty blocks to prevent infinite retry.
                for block in begin..end {
                    if self.entry(index).blocks[block].refcount == 0 {
                        self.drop_block(index, block);
                    }
                }

                self.fail_piece_jobs(index, &err.to_string(), completions);
            }
        }

        if self.arena[index].is_some() {
            requeue.extend(self.entry_mut(index).deferred.drain(..));
        }
        self.maybe_free_piece(index);
        self.sync_block_gauges();
    }

    /// Plan flushes for expired write pieces, oldest first.
    pub fn flush_expired(&mut self, now: Instant, expiry: Duration, max_pieces: usize) -> Vec<FlushPlan> {
        let candidates: Vec<usize> = self.lists[CacheState::WriteLru.index()]
            .indices(&self.arena)
            .into_iter()
            .filter(|&index| {
                let entry = self.entry(index);
                entry.piece_refcount == 0 && now.duration_since(entry.last_touch) >= expiry
            })
            .take(max_pieces)
            .collect();

        let mut plans = Vec::new();
        for index in candidates {
            plans.extend(self.collect_flush_plans(index));
        }

        plans
    }

    //------------------------------------------------------------------------//

    /// Try to advance the hash cursor of a piece.
    ///
    /// Locks the run of resident blocks at the cursor and hands back a plan
    /// to digest them with the cache lock released.
    pub fn kick_hasher(&mut self, index: usize) -> KickHash {
        if self.entry(index).hashing {
            return KickHash::Busy;
        }

        if self.entry(index).hash.is_none() {
            let digest_kind = self.entry(index).digest_kind;
            self.entry_mut(index).hash = Some(PartialHash::new(digest_kind));
        }

        let cursor = self.entry(index).hash.as_ref().unwrap().cursor();
        if cursor >= self.entry(index).piece_len {
            self.entry_mut(index).hashing_done = true;
            return KickHash::Done(self.entry(index).hash.as_ref().unwrap().finish());
        }

        let begin = cursor / BLOCK_SIZE;
        let (end, buffers) = {
            let entry = self.entry_mut(index);
            let mut end = begin;
            let mut buffers = Vec::new();

            while end < entry.blocks_in_piece() {
                let length = cmp::min(BLOCK_SIZE, entry.piece_len - end * BLOCK_SIZE);
                let slot = &mut entry.blocks[end];
                match slot.buf.as_ref() {
                    Some(buf) if !slot.uninitialized => {
                        slot.refcount += 1;
                        buffers.push(buf[..length].to_vec());
                        end += 1;
                    }
                    _ => break,
                }
            }

            (end, buffers)
        };

        if buffers.is_empty() {
            self.entry_mut(index).need_readback = true;
            return KickHash::Blocked;
        }

        for block in begin..end {
            if self.entry(index).blocks[block].refcount == 1 {
                self.pinned_blocks += 1;
            }
        }

        let key = self.entry(index).key;
        let hash = self.entry_mut(index).hash.take().unwrap();
        self.entry_mut(index).hashing = true;
        self.sync_block_gauges();

        KickHash::Plan(HashPlan { index, key, begin, end, hash, buffers })
    }

    /// Put back the hash state advanced outside the lock.
    ///
    /// Finalizes queued hash jobs when the cursor reached the piece end.
    /// Returns true if the cursor may be able to advance further.
    pub fn complete_hash(&mut self, plan_index: usize, begin: usize, end: usize, hash: PartialHash, completions: &mut Vec<ODiskMessage>) -> bool {
        use std::sync::atomic::Ordering;

        let index = plan_index;
        for block in begin..end {
            let now_unpinned = {
                let slot = &mut self.entry_mut(index).blocks[block];
                debug_assert!(slot.refcount > 0);
                slot.refcount -= 1;

                slot.refcount == 0
            };
            if now_unpinned {
                self.pinned_blocks -= 1;
            }
        }
        self.stats.blocks_hashed.fetch_add(end - begin, Ordering::Relaxed);

        let finished = hash.cursor() >= self.entry(index).piece_len;
        let digest = if finished { Some(hash.finish()) } else { None };

        {
            let entry = self.entry_mut(index);
            entry.hashing = false;
            entry.hash = Some(hash);
            entry.hashing_done = finished;
            if finished {
                entry.need_readback = false;
            }
        }

        if let Some(digest) = digest {
            let key = self.entry(index).key;
            let parked = std::mem::replace(&mut self.entry_mut(index).jobs, Default::default());

            for job in parked {
                match job {
                    DiskJob::HashPiece { .. } => {
                        completions.push(ODiskMessage::PieceHashed(key.0, key.1, digest));
                    }
                    other => self.entry_mut(index).jobs.push_back(other),
                }
            }
        }

        self.maybe_free_piece(index);
        self.sync_block_gauges();

        !finished
    }

    //------------------------------------------------------------------------//

    /// Drop every unreferenced clean block of a piece.
    ///
    /// If nothing pins the piece afterwards it becomes a ghost, retaining
    /// only its identity.
    pub fn evict_piece(&mut self, index: usize) -> bool {
        for block in 0..self.entry(index).blocks_in_piece() {
            if self.entry(index).blocks[block].is_evictable() {
                self.drop_block(index, block);
            }
        }

        let evicted = {
            let entry = self.entry(index);
            entry.num_blocks == 0 && entry.refcount() == 0 && entry.jobs.is_empty() && entry.deferred.is_empty()
        };
        if evicted {
            self.retire_piece(index);
        }
        self.sync_block_gauges();

        evicted
    }

    /// Remove up to `count` clean blocks across pieces in ARC order.
    ///
    /// Returns the shortfall, zero when the full count was evicted. Blocks
    /// of the `ignore` piece are never touched.
    pub fn try_evict_blocks(&mut self, count: usize, ignore: Option<usize>) -> usize {
        let mut remaining = count;

        // The volatile list empties first, then the side of the ARC pair
        // chosen by the last ghost hit, largest side first on a plain miss.
        let lru1 = self.lists[CacheState::ReadLru1.index()].len();
        let lru2 = self.lists[CacheState::ReadLru2.index()].len();

        let read_order = match self.last_cache_op {
            LastCacheOp::GhostHitLru1 => [CacheState::ReadLru2, CacheState::ReadLru1],
            LastCacheOp::GhostHitLru2 => [CacheState::ReadLru1, CacheState::ReadLru2],
            LastCacheOp::Insert if lru2 > lru1 => [CacheState::ReadLru2, CacheState::ReadLru1],
            LastCacheOp::Insert => [CacheState::ReadLru1, CacheState::ReadLru2],
        };

        let order = [CacheState::VolatileReadLru, read_order[0], read_order[1]];
        for state in order.iter() {
            if remaining == 0 {
                break;
            }

            for index in self.lists[state.index()].indices(&self.arena) {
                if remaining == 0 {
                    break;
                }
                if Some(index) == ignore {
                    continue;
                }

                for block in 0..self.entry(index).blocks_in_piece() {
                    if remaining == 0 {
                        break;
                    }
                    if self.entry(index).blocks[block].is_evictable() {
                        self.drop_block(index, block);
                        remaining -= 1;
                    }
                }

                let emptied = {
                    let entry = self.entry(index);
                    entry.num_blocks == 0 && entry.refcount() == 0 && entry.jobs.is_empty() && entry.deferred.is_empty()
                };
                if emptied {
                    self.retire_piece(index);
                }
            }
        }
        self.sync_block_gauges();

        remaining
    }

    /// Move an emptied piece to its ghost list, or drop it entirely.
    fn retire_piece(&mut self, index: usize) {
        debug_assert_eq!(0, self.entry(index).num_blocks);

        match self.entry(index).cache_state.ghost_state() {
            Some(ghost) => {
                self.set_state(index, ghost);

                let ghost_limit = self.settings.ghost_limit();
                if self.lists[ghost.index()].len() > ghost_limit {
                    if let Some(oldest) = self.lists[ghost.index()].front() {
                        self.remove_piece(oldest);
                    }
                }
            }
            None => self.remove_piece(index),
        }
    }

    /// Drop a freshly allocated entry an aborted operation left empty.
    ///
    /// An empty piece on the write list would otherwise linger forever,
    /// the eviction scans never visit it.
    fn drop_if_empty(&mut self, index: usize) {
        let empty = {
            let entry = self.entry(index);
            entry.num_blocks == 0
                && entry.refcount() == 0
                && entry.jobs.is_empty()
                && entry.deferred.is_empty()
                && entry.hash.is_none()
        };
        if empty {
            self.remove_piece(index);
        }
    }

    /// Remove a piece from the arena, the map, and its list.
    fn remove_piece(&mut self, index: usize) {
        let state = self.entry(index).cache_state;
        self.lists[state.index()].remove(&mut self.arena, index);

        let entry = self.arena[index].take().expect("bep_disk: BlockCache::remove_piece Missing Arena Entry");
        debug_assert!(entry.jobs.is_empty() && entry.deferred.is_empty());
        debug_assert_eq!(0, entry.piece_refcount);

        for slot in entry.blocks.iter() {
            debug_assert!(slot.buf.is_none());
        }

        self.map.remove(&entry.key);
        self.free_slots.push(index);
        self.sync_list_gauges();
    }

    /// Tear down a piece whose refcount dropped to zero after deletion.
    fn maybe_free_piece(&mut self, index: usize) {
        let free = match self.arena[index].as_ref() {
            Some(entry) => entry.marked_for_deletion && entry.refcount() == 0,
            None => false,
        };
        if !free {
            return;
        }

        for block in 0..self.entry(index).blocks_in_piece() {
            if self.entry(index).blocks[block].buf.is_some() {
                self.drop_block(index, block);
            }
        }
        self.remove_piece(index);
    }

    /// Drop a piece from the cache, discarding dirty blocks.
    ///
    /// Parked jobs are failed with operation aborted. A piece that is still
    /// pinned is marked for deletion and torn down on the release path.
    pub fn clear_piece(&mut self, index: usize, completions: &mut Vec<ODiskMessage>) {
        let parked: Vec<DiskJob> = {
            let entry = self.entry_mut(index);
            entry.jobs.drain(..).chain(entry.deferred.drain(..)).collect()
        };
        for job in parked {
            if let Some(msg) = job.into_aborted() {
                completions.push(msg);
            }
        }

        if self.entry(index).refcount() > 0 {
            self.entry_mut(index).marked_for_deletion = true;
            return;
        }

        for block in 0..self.entry(index).blocks_in_piece() {
            if self.entry(index).blocks[block].buf.is_some() && self.entry(index).blocks[block].refcount == 0 {
                self.drop_block(index, block);
            }
        }
        self.remove_piece(index);
        self.sync_block_gauges();
    }

    /// Tear down every piece of a storage, discarding dirty blocks.
    pub fn abort_storage(&mut self, hash: &bep_util::bt::InfoHash, completions: &mut Vec<ODiskMessage>) {
        for index in self.storage_pieces(hash) {
            self.clear_piece(index, completions);
        }
    }

    /// Evict clean blocks until the pool sits at the low watermark.
    ///
    /// Returns the number of blocks freed.
    pub fn trim(&mut self) -> usize {
        let in_use = self.pool.in_use();
        let target = self.settings.low_watermark();

        if in_use <= target {
            return 0;
        }

        let want = in_use - target;
        want - self.try_evict_blocks(want, None)
    }

    /// Evict if the pool has grown past the high watermark.
    ///
    /// Called by the workers before executing each job.
    pub fn level_check(&mut self) {
        if self.pool.in_use() >= self.pool.capacity() {
            let want = self.pool.in_use() - self.settings.low_watermark();
            self.try_evict_blocks(want, None);
        }
    }

    /// Fail every parked job and drop every piece. Shutdown path, callers
    /// must have waited for pinned blocks to be released.
    pub fn clear(&mut self, completions: &mut Vec<ODiskMessage>) {
        debug_assert_eq!(0, self.pinned_blocks);

        let indices: Vec<usize> = (0..self.arena.len()).filter(|&index| self.arena[index].is_some()).collect();
        for index in indices {
            self.clear_piece(index, completions);
        }
    }

    //------------------------------------------------------------------------//

    /// Validate the §8 structural invariants, test and debug support.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let mut pinned = 0;
        let mut resident = 0;

        for entry in self.arena.iter().filter_map(|slot| slot.as_ref()) {
            let num_blocks = entry.blocks.iter().filter(|block| block.buf.is_some()).count();
            let num_dirty = entry.blocks.iter().filter(|block| block.dirty).count();

            assert_eq!(entry.num_blocks, num_blocks);
            assert_eq!(entry.num_dirty, num_dirty);
            assert!(entry.num_dirty <= entry.num_blocks);
            assert!(entry.num_blocks <= entry.blocks_in_piece());

            if entry.cache_state.is_ghost() {
                assert_eq!(0, entry.num_blocks);
            }

            for block in entry.blocks.iter() {
                if block.refcount > 0 {
                    assert!(block.buf.is_some());
                    pinned += 1;
                }
                if block.dirty {
                    assert!(block.buf.is_some() && !block.written);
                }
            }

            resident += num_blocks;
        }

        assert_eq!(self.pinned_blocks, pinned);
        assert_eq!(self.read_blocks + self.write_blocks, resident);
        assert!(resident <= self.pool.in_use());

        for (state_index, list) in self.lists.iter().enumerate() {
            for index in list.indices(&self.arena) {
                assert_eq!(state_index, self.entry(index).cache_state.index());
            }
        }
    }

    #[cfg(test)]
    pub fn list_len(&self, state: CacheState) -> usize {
        self.lists[state.index()].len()
    }

    #[cfg(test)]
    pub fn list_back(&self, state: CacheState) -> Option<usize> {
        self.lists[state.index()].back()
    }

    #[cfg(test)]
    pub fn piece_state(&self, index: usize) -> CacheState {
        self.entry(index).cache_state
    }
}

/// Block index a write job's payload belongs to.
fn block_index_of(block: &crate::memory::block::Block) -> usize {
    block.metadata().block_offset() as usize / BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{AddDirty, BlockCache, CacheRead, AllocatePending, KickHash};
    use crate::cache::hash::{DigestKind, PieceHash};
    use crate::cache::piece::CacheState;
    use crate::disk::job::DiskJob;
    use crate::disk::FileFlags;
    use crate::memory::block::{Block, BlockMetadata};
    use crate::memory::buffer_pool::BufferPool;
    use crate::settings::DiskSettings;
    use crate::stats::DiskStats;
    use crate::BLOCK_SIZE;

    use bep_util::bt::InfoHash;
    use bep_util::sha::ShaHash;
    use bytes::Bytes;

    fn test_cache(cache_blocks: usize) -> BlockCache {
        let mut settings = DiskSettings::default();
        settings.cache_size = cache_blocks;

        let pool = Arc::new(BufferPool::new(cache_blocks, BLOCK_SIZE));
        let stats = Arc::new(DiskStats::new());

        BlockCache::new(settings, pool, stats)
    }

    fn storage_hash(seed: u8) -> InfoHash {
        [seed; 20].into()
    }

    fn write_job(hash: InfoHash, piece: u64, block: usize, fill: u8) -> DiskJob {
        let metadata = BlockMetadata::new(hash, piece, (block * BLOCK_SIZE) as u64, BLOCK_SIZE);

        DiskJob::ProcessBlock {
            block: Block::new(metadata, Bytes::from(vec![fill; BLOCK_SIZE])),
            flags: FileFlags::empty(),
        }
    }

    /// Install a single clean read block for (hash, piece).
    fn insert_read_piece(cache: &mut BlockCache, hash: InfoHash, piece: u64, fill: u8) -> usize {
        let index = cache.allocate_piece((hash, piece), 1, BLOCK_SIZE, DigestKind::Sha1, CacheState::ReadLru1);

        match cache.allocate_pending(index, 0, 1) {
            AllocatePending::Read(mut plan) => {
                for buffer in plan.buffers.iter_mut() {
                    for byte in buffer.iter_mut() {
                        *byte = fill;
                    }
                }

                let mut completions = Vec::new();
                let mut requeue = Vec::new();
                cache.mark_read_done(plan, Ok(()), &mut completions, &mut requeue);
            }
            AllocatePending::Nothing => {}
            AllocatePending::NoRoom => panic!("Cache Had No Room For Test Piece"),
        }

        index
    }

    #[test]
    fn positive_cache_hit_hands_out_pinned_reference() {
        let mut cache = test_cache(8);
        let hash = storage_hash(1);

        match cache.add_dirty_block(write_job(hash, 5, 0, 0xAB), 1, BLOCK_SIZE, DigestKind::Sha1) {
            AddDirty::Queued => {}
            _ => panic!("Expected Queued Dirty Block"),
        }

        let metadata = BlockMetadata::new(hash, 5, 0, BLOCK_SIZE);
        let mut scratch = vec![0u8; BLOCK_SIZE];
        let handle = match cache.try_read(&metadata, false, &mut scratch[..]) {
            CacheRead::Pinned(handle, length) => {
                assert_eq!(BLOCK_SIZE, length);
                handle
            }
            _ => panic!("Expected A Pinned Reference"),
        };

        assert_eq!(1, cache.pinned_blocks());
        cache.with_pinned(&handle, |bytes| assert!(bytes.iter().all(|&byte| byte == 0xAB)));
        cache.check_invariants();

        cache.release_block(handle);
        assert_eq!(0, cache.pinned_blocks());
        cache.check_invariants();
    }

    #[test]
    fn positive_force_copy_copies_instead_of_pinning() {
        let mut cache = test_cache(8);
        let hash = storage_hash(2);
        insert_read_piece(&mut cache, hash, 0, 0xCD);

        let metadata = BlockMetadata::new(hash, 0, 0, BLOCK_SIZE);
        let mut out = vec![0u8; BLOCK_SIZE];
        match cache.try_read(&metadata, true, &mut out[..]) {
            CacheRead::Copied(length) => assert_eq!(BLOCK_SIZE, length),
            _ => panic!("Expected A Copied Read"),
        }

        assert_eq!(0, cache.pinned_blocks());
        assert!(out.iter().all(|&byte| byte == 0xCD));
    }

    #[test]
    fn positive_arc_promotion_on_second_read() {
        let mut cache = test_cache(128);
        let hash = storage_hash(3);

        for piece in 0..100 {
            insert_read_piece(&mut cache, hash, piece, piece as u8);
        }
        assert_eq!(100, cache.list_len(CacheState::ReadLru1));

        // Re reading piece 50 promotes it to the frequency side.
        let metadata = BlockMetadata::new(hash, 50, 0, BLOCK_SIZE);
        let mut out = vec![0u8; BLOCK_SIZE];
        match cache.try_read(&metadata, true, &mut out[..]) {
            CacheRead::Copied(_) => {}
            _ => panic!("Expected A Cache Hit"),
        }

        assert_eq!(99, cache.list_len(CacheState::ReadLru1));
        assert_eq!(1, cache.list_len(CacheState::ReadLru2));

        let promoted = cache.find_piece(&(hash, 50)).unwrap();
        assert_eq!(CacheState::ReadLru2, cache.piece_state(promoted));

        // A third read keeps it at the frequency tail.
        match cache.try_read(&metadata, true, &mut out[..]) {
            CacheRead::Copied(_) => {}
            _ => panic!("Expected A Cache Hit"),
        }
        assert_eq!(Some(promoted), cache.list_back(CacheState::ReadLru2));
        cache.check_invariants();
    }

    #[test]
    fn positive_ghost_hit_promotes_and_steers() {
        let mut cache = test_cache(8);
        let hash = storage_hash(4);

        let index = insert_read_piece(&mut cache, hash, 7, 0x11);
        assert!(cache.evict_piece(index));
        assert_eq!(CacheState::ReadLru1Ghost, cache.piece_state(index));
        assert_eq!(1, cache.list_len(CacheState::ReadLru1Ghost));

        // Touching the ghost re materializes it on the frequency side.
        let again = cache.allocate_piece((hash, 7), 1, BLOCK_SIZE, DigestKind::Sha1, CacheState::ReadLru1);
        assert_eq!(index, again);
        assert_eq!(CacheState::ReadLru2, cache.piece_state(index));
        assert_eq!(0, cache.list_len(CacheState::ReadLru1Ghost));
        cache.check_invariants();
    }

    #[test]
    fn positive_eviction_skips_ignored_piece() {
        let mut cache = test_cache(8);
        let hash = storage_hash(5);

        let keep = insert_read_piece(&mut cache, hash, 0, 0x22);
        insert_read_piece(&mut cache, hash, 1, 0x33);

        let shortfall = cache.try_evict_blocks(2, Some(keep));
        assert_eq!(1, shortfall);

        let metadata = BlockMetadata::new(hash, 0, 0, BLOCK_SIZE);
        let mut out = vec![0u8; BLOCK_SIZE];
        match cache.try_read(&metadata, true, &mut out[..]) {
            CacheRead::Copied(_) => {}
            _ => panic!("Ignored Piece Was Evicted"),
        }
        cache.check_invariants();
    }

    #[test]
    fn positive_dirty_blocks_never_evicted() {
        let mut cache = test_cache(8);
        let hash = storage_hash(6);

        match cache.add_dirty_block(write_job(hash, 0, 0, 0x44), 1, BLOCK_SIZE, DigestKind::Sha1) {
            AddDirty::Queued => {}
            _ => panic!("Expected Queued Dirty Block"),
        }

        let shortfall = cache.try_evict_blocks(4, None);
        assert_eq!(4, shortfall);

        let index = cache.find_piece(&(hash, 0)).unwrap();
        assert_eq!(CacheState::WriteLru, cache.piece_state(index));
        cache.check_invariants();
    }

    #[test]
    fn positive_flush_moves_piece_to_read_machine() {
        let mut cache = test_cache(8);
        let hash = storage_hash(7);

        match cache.add_dirty_block(write_job(hash, 0, 0, 0x55), 1, BLOCK_SIZE, DigestKind::Sha1) {
            AddDirty::Queued => {}
            _ => panic!("Expected Queued Dirty Block"),
        }
        let index = cache.find_piece(&(hash, 0)).unwrap();

        // Hash first so the prefix is flushable.
        let mut completions = Vec::new();
        match cache.kick_hasher(index) {
            KickHash::Plan(mut plan) => {
                for buffer in plan.buffers.iter() {
                    plan.hash.update(buffer);
                }
                cache.complete_hash(plan.index, plan.begin, plan.end, plan.hash, &mut completions);
            }
            _ => panic!("Expected A Hash Plan"),
        }

        let plan = cache.try_flush_hashed(index, 1).expect("Expected A Flush Plan");
        assert_eq!((0, 1), (plan.begin, plan.end));

        let mut requeue = Vec::new();
        cache.mark_flush_done(&plan, Ok(()), &mut completions, &mut requeue);

        // The parked write job completed and the piece joined the read side.
        assert!(completions
            .iter()
            .any(|msg| match msg {
                crate::disk::ODiskMessage::BlockProcessed(_) => true,
                _ => false,
            }));
        assert_eq!(CacheState::ReadLru1, cache.piece_state(index));
        cache.check_invariants();
    }

    #[test]
    fn positive_incremental_hash_matches_one_shot() {
        let mut cache = test_cache(8);
        let hash = storage_hash(8);
        let piece_len = BLOCK_SIZE + 100;

        match cache.add_dirty_block(write_job(hash, 0, 0, 0x66), 2, piece_len, DigestKind::Sha1) {
            AddDirty::Queued => {}
            _ => panic!("Expected Queued Dirty Block"),
        }

        let short_metadata = BlockMetadata::new(hash, 0, BLOCK_SIZE as u64, 100);
        let short_job = DiskJob::ProcessBlock {
            block: Block::new(short_metadata, Bytes::from(vec![0x77u8; 100])),
            flags: FileFlags::empty(),
        };
        match cache.add_dirty_block(short_job, 2, piece_len, DigestKind::Sha1) {
            AddDirty::Queued => {}
            _ => panic!("Expected Queued Dirty Block"),
        }

        let index = cache.find_piece(&(hash, 0)).unwrap();
        let mut completions = Vec::new();
        loop {
            match cache.kick_hasher(index) {
                KickHash::Plan(mut plan) => {
                    for buffer in plan.buffers.iter() {
                        plan.hash.update(buffer);
                    }
                    if !cache.complete_hash(plan.index, plan.begin, plan.end, plan.hash, &mut completions) {
                        break;
                    }
                }
                KickHash::Done(_) => break,
                _ => panic!("Hashing Stalled On Resident Blocks"),
            }
        }

        let mut all_bytes = vec![0x66u8; BLOCK_SIZE];
        all_bytes.extend_from_slice(&[0x77u8; 100]);
        let expected = PieceHash::Sha1(ShaHash::from_bytes(&all_bytes));

        match cache.kick_hasher(index) {
            KickHash::Done(digest) => assert_eq!(expected, digest),
            _ => panic!("Expected A Finished Hash"),
        }
        cache.check_invariants();
    }

    #[test]
    fn positive_volatile_block_discarded_on_release() {
        let mut cache = test_cache(8);
        let hash = storage_hash(9);

        let index = cache.allocate_piece((hash, 0), 1, BLOCK_SIZE, DigestKind::Sha1, CacheState::VolatileReadLru);
        match cache.allocate_pending(index, 0, 1) {
            AllocatePending::Read(plan) => {
                let mut completions = Vec::new();
                let mut requeue = Vec::new();
                cache.mark_read_done(plan, Ok(()), &mut completions, &mut requeue);
            }
            _ => panic!("Expected A Read Plan"),
        }

        let metadata = BlockMetadata::new(hash, 0, 0, BLOCK_SIZE);
        let mut out = vec![0u8; BLOCK_SIZE];
        let handle = match cache.try_read(&metadata, false, &mut out[..]) {
            CacheRead::Pinned(handle, _) => handle,
            _ => panic!("Expected A Pinned Reference"),
        };

        cache.release_block(handle);

        // The volatile piece was torn down with its last reference.
        assert!(cache.find_piece(&(hash, 0)).is_none());
        cache.check_invariants();
    }

    #[test]
    fn positive_trim_frees_down_to_low_watermark() {
        let mut cache = test_cache(16);
        let hash = storage_hash(10);

        for piece in 0..16 {
            insert_read_piece(&mut cache, hash, piece, piece as u8);
        }

        let freed = cache.trim();
        assert!(freed >= 2);
        cache.check_invariants();
    }
}
