use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared counters exported by the disk subsystem.
///
/// All counters are monotonic except the gauge style fields which track
/// current pool occupancy, pinned blocks, and outstanding fences.
#[derive(Default)]
pub struct DiskStats {
    pub blocks_read: AtomicUsize,
    pub blocks_written: AtomicUsize,
    pub blocks_hashed: AtomicUsize,
    pub cache_hits: AtomicUsize,
    pub cache_misses: AtomicUsize,
    pub read_cache_blocks: AtomicUsize,
    pub write_cache_blocks: AtomicUsize,
    pub pinned_blocks: AtomicUsize,
    pub arc_mru_size: AtomicUsize,
    pub arc_mru_ghost_size: AtomicUsize,
    pub arc_mfu_size: AtomicUsize,
    pub arc_mfu_ghost_size: AtomicUsize,
    pub arc_write_size: AtomicUsize,
    pub arc_volatile_size: AtomicUsize,
    pub blocked_jobs: AtomicUsize,
    pub fences_raised: AtomicUsize,
}

impl DiskStats {
    pub fn new() -> DiskStats {
        DiskStats::default()
    }

    /// Take a point in time snapshot of every counter.
    pub fn snapshot(&self) -> DiskStatsSnapshot {
        DiskStatsSnapshot {
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            blocks_hashed: self.blocks_hashed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            read_cache_blocks: self.read_cache_blocks.load(Ordering::Relaxed),
            write_cache_blocks: self.write_cache_blocks.load(Ordering::Relaxed),
            pinned_blocks: self.pinned_blocks.load(Ordering::Relaxed),
            arc_mru_size: self.arc_mru_size.load(Ordering::Relaxed),
            arc_mru_ghost_size: self.arc_mru_ghost_size.load(Ordering::Relaxed),
            arc_mfu_size: self.arc_mfu_size.load(Ordering::Relaxed),
            arc_mfu_ghost_size: self.arc_mfu_ghost_size.load(Ordering::Relaxed),
            arc_write_size: self.arc_write_size.load(Ordering::Relaxed),
            arc_volatile_size: self.arc_volatile_size.load(Ordering::Relaxed),
            blocked_jobs: self.blocked_jobs.load(Ordering::Relaxed),
            fences_raised: self.fences_raised.load(Ordering::Relaxed),
        }
    }
}

/// Point in time copy of the disk counters.
#[derive(Copy, Clone, Debug, Default)]
pub struct DiskStatsSnapshot {
    pub blocks_read: usize,
    pub blocks_written: usize,
    pub blocks_hashed: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub read_cache_blocks: usize,
    pub write_cache_blocks: usize,
    pub pinned_blocks: usize,
    pub arc_mru_size: usize,
    pub arc_mru_ghost_size: usize,
    pub arc_mfu_size: usize,
    pub arc_mfu_ghost_size: usize,
    pub arc_write_size: usize,
    pub arc_volatile_size: usize,
    pub blocked_jobs: usize,
    pub fences_raised: usize,
}
