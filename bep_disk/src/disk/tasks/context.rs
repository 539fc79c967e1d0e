use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use crate::cache::BlockCache;
use crate::disk::fence::{RaiseFence, StorageFence};
use crate::disk::fs::FileSystem;
use crate::disk::job::DiskJob;
use crate::disk::pool::JobQueues;
use crate::disk::storage::{StorageLayout, TorrentStorage};
use crate::disk::ODiskMessage;
use crate::memory::buffer_pool::BufferPool;
use crate::settings::DiskSettings;
use crate::stats::DiskStats;

use bep_util::bt::InfoHash;
use futures::sink::{Sink, Wait};
use futures::sync::mpsc::Sender;

/// Storage plus its fence, one per added torrent.
pub struct TorrentEntry<F> {
    pub storage: TorrentStorage<F>,
    pub fence: StorageFence,
}

impl<F> TorrentEntry<F> {
    pub fn new(storage: TorrentStorage<F>) -> TorrentEntry<F> {
        TorrentEntry { storage, fence: StorageFence::new() }
    }
}

/// Shared state every disk worker operates against.
pub struct DiskManagerContext<F> {
    torrents: Arc<RwLock<HashMap<InfoHash, Mutex<TorrentEntry<F>>>>>,
    cache: Arc<Mutex<BlockCache>>,
    pool: Arc<BufferPool>,
    stats: Arc<DiskStats>,
    settings: DiskSettings,
    out: Sender<ODiskMessage>,
    fs: Arc<F>,
}

impl<F> DiskManagerContext<F>
where
    F: FileSystem,
{
    pub fn new(
        out: Sender<ODiskMessage>,
        fs: F,
        cache: BlockCache,
        pool: Arc<BufferPool>,
        stats: Arc<DiskStats>,
        settings: DiskSettings,
    ) -> DiskManagerContext<F> {
        DiskManagerContext {
            torrents: Arc::new(RwLock::new(HashMap::new())),
            cache: Arc::new(Mutex::new(cache)),
            pool,
            stats,
            settings,
            out,
            fs: Arc::new(fs),
        }
    }

    pub fn blocking_sender(&self) -> Wait<Sender<ODiskMessage>> {
        self.out.clone().wait()
    }

    pub fn filesystem(&self) -> &Arc<F> {
        &self.fs
    }

    pub fn settings(&self) -> &DiskSettings {
        &self.settings
    }

    pub fn stats(&self) -> &Arc<DiskStats> {
        &self.stats
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Run the given closure with the cache mutex held.
    pub fn run_with_cache<C, R>(&self, call: C) -> R
    where
        C: FnOnce(&mut BlockCache) -> R,
    {
        let mut lock_cache = self.cache.lock().expect("bep_disk: DiskManagerContext Poisoned Cache Lock");

        call(&mut *lock_cache)
    }

    pub fn insert_torrent(&self, layout: StorageLayout) -> bool {
        let mut write_torrents = self
            .torrents
            .write()
            .expect("bep_disk: DiskManagerContext::insert_torrent Failed To Write Torrents");

        let hash = *layout.info_hash();
        let hash_not_exists = !write_torrents.contains_key(&hash);

        if hash_not_exists {
            let storage = TorrentStorage::new(layout, self.fs.clone(), PathBuf::new());
            write_torrents.insert(hash, Mutex::new(TorrentEntry::new(storage)));
        }

        hash_not_exists
    }

    /// Run the given closure with the torrent entry locked.
    pub fn update_torrent<C, R>(&self, hash: InfoHash, call: C) -> Option<R>
    where
        C: FnOnce(&mut TorrentEntry<F>) -> R,
    {
        let read_torrents = self
            .torrents
            .read()
            .expect("bep_disk: DiskManagerContext::update_torrent Failed To Read Torrents");

        read_torrents.get(&hash).map(|entry| {
            let mut lock_entry = entry
                .lock()
                .expect("bep_disk: DiskManagerContext::update_torrent Failed To Lock Entry");

            call(&mut *lock_entry)
        })
    }

    pub fn remove_torrent(&self, hash: InfoHash) -> Option<TorrentEntry<F>> {
        let mut write_torrents = self
            .torrents
            .write()
            .expect("bep_disk: DiskManagerContext::remove_torrent Failed To Write Torrents");

        write_torrents.remove(&hash).map(|entry| {
            entry
                .into_inner()
                .expect("bep_disk: DiskManagerContext::remove_torrent Poisoned Entry")
        })
    }

    /// Every torrent currently added, used by shutdown and flush sweeps.
    pub fn torrent_hashes(&self) -> Vec<InfoHash> {
        let read_torrents = self
            .torrents
            .read()
            .expect("bep_disk: DiskManagerContext::torrent_hashes Failed To Read Torrents");

        read_torrents.keys().copied().collect()
    }

    //------------------------------------------------------------------------//

    /// Submit a job, routing it through the storage's fence.
    ///
    /// Fence jobs raise the fence: either they run immediately or an
    /// internal flush is pushed ahead of them and they park until the
    /// storage quiesces. Non fence jobs behind a raised fence are held in
    /// the per storage blocked queue.
    pub fn add_job(&self, job: DiskJob, queues: &JobQueues) {
        use std::sync::atomic::Ordering;

        let storage = job.storage();

        if job.is_fence() {
            let hash = storage.expect("bep_disk: Fence Job Without A Storage");
            let cache_work = self.run_with_cache(|cache| {
                cache.storage_pieces(&hash).into_iter().any(|index| cache.piece_has_work(index))
            });

            let mut fence_job = Some(job);
            let raised = self.update_torrent(hash, |entry| {
                entry.fence.raise_fence(fence_job.take().unwrap(), cache_work)
            });
            match raised {
                Some(RaiseFence::PostFence(job)) => {
                    self.stats.fences_raised.fetch_add(1, Ordering::Relaxed);
                    queues.push_front_general(job);
                }
                Some(RaiseFence::PostFlush) => {
                    self.stats.fences_raised.fetch_add(1, Ordering::Relaxed);
                    queues.push_front_general(DiskJob::FlushStorage { hash, internal: true });
                }
                // Unknown torrent, let the handler surface the error.
                None => queues.push_back(fence_job.take().unwrap()),
            }
            return;
        }

        if let Some(hash) = storage {
            let exempt = job_is_fence_exempt(&job);
            let mut queue_job = Some(job);
            let handled = self.update_torrent(hash, |entry| {
                if entry.fence.is_raised() && !exempt {
                    entry.fence.block_job(queue_job.take().unwrap());
                    true
                } else {
                    if !exempt {
                        entry.fence.job_queued();
                    }
                    false
                }
            });

            match (handled, queue_job) {
                (Some(true), _) => {
                    self.stats.blocked_jobs.fetch_add(1, Ordering::Relaxed);
                }
                (_, Some(job)) => queues.push_back(job),
                _ => {}
            }
            return;
        }

        queues.push_back(job);
    }

    /// Record a counted job leaving execution, possibly admitting a fence.
    pub fn job_finished(&self, hash: InfoHash, queues: &JobQueues) {
        let admitted = self.update_torrent(hash, |entry| entry.fence.job_finished());

        if let Some(Some(fence_job)) = admitted {
            queues.push_front_general(fence_job);
        }
    }

    /// Lower the fence after its job completed, re admitting held jobs.
    pub fn fence_finished(&self, hash: InfoHash, queues: &JobQueues) {
        use std::sync::atomic::Ordering;

        let lowered = self.update_torrent(hash, |entry| entry.fence.fence_finished());

        if let Some((next_fence, unblocked)) = lowered {
            if let Some(fence_job) = next_fence {
                queues.push_front_general(fence_job);
            }
            for job in unblocked {
                self.stats.blocked_jobs.fetch_sub(1, Ordering::Relaxed);
                self.add_job(job, queues);
            }
        }
    }
}

/// Internal jobs scheduled by the pool run ahead of fences.
pub fn job_is_fence_exempt(job: &DiskJob) -> bool {
    match job {
        DiskJob::FlushStorage { internal: true, .. } | DiskJob::FlushHashed { .. } => true,
        _ => false,
    }
}

impl<F> Clone for DiskManagerContext<F> {
    fn clone(&self) -> DiskManagerContext<F> {
        DiskManagerContext {
            torrents: self.torrents.clone(),
            cache: self.cache.clone(),
            pool: self.pool.clone(),
            stats: self.stats.clone(),
            settings: self.settings,
            out: self.out.clone(),
            fs: self.fs.clone(),
        }
    }
}
