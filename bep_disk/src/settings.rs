use std::cmp;

/// Default number of cache blocks the pool will hand out.
const DEFAULT_CACHE_SIZE: usize = 1024;

/// Default seconds a dirty block may sit unflushed in the write cache.
const DEFAULT_CACHE_EXPIRY_SECS: u64 = 300;

/// Default number of contiguous blocks required before a dirty prefix flush.
const DEFAULT_READ_LINE_SIZE: usize = 32;

/// Default number of worker threads.
const DEFAULT_WORKER_THREADS: usize = 4;

/// Default bound on jobs queued but not yet picked up by a worker.
const DEFAULT_MAX_QUEUED_JOBS: usize = 1024;

/// Tunable settings for the disk manager and its block cache.
#[derive(Copy, Clone, Debug)]
pub struct DiskSettings {
    /// Number of 16 KiB blocks the cache may hold.
    pub cache_size: usize,
    /// Seconds before an unflushed dirty block is force flushed.
    pub cache_expiry_secs: u64,
    /// Contiguous dirty blocks required before a hashed prefix flush.
    pub read_line_size: usize,
    /// Worker threads executing disk jobs.
    pub worker_threads: usize,
    /// Bound on jobs queued but not yet executing.
    pub max_queued_jobs: usize,
    /// Allow a flush to span several fully hashed adjacent pieces.
    pub coalesce_piece_flush: bool,
}

impl DiskSettings {
    /// Bound on entries in each ghost list.
    ///
    /// The larger of eight entries or the cache size scaled down by twice
    /// the read line, matching the write up in the cache module.
    pub fn ghost_limit(&self) -> usize {
        let scaled = self.cache_size / (cmp::max(self.read_line_size, 4) * 2);

        cmp::max(8, scaled)
    }

    /// Blocks the cache tries to stay below after a trim request.
    pub fn low_watermark(&self) -> usize {
        (self.cache_size / 8) * 7
    }
}

impl Default for DiskSettings {
    fn default() -> DiskSettings {
        DiskSettings {
            cache_size: DEFAULT_CACHE_SIZE,
            cache_expiry_secs: DEFAULT_CACHE_EXPIRY_SECS,
            read_line_size: DEFAULT_READ_LINE_SIZE,
            worker_threads: DEFAULT_WORKER_THREADS,
            max_queued_jobs: DEFAULT_MAX_QUEUED_JOBS,
            coalesce_piece_flush: true,
        }
    }
}
