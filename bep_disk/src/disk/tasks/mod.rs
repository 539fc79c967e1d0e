use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::cache::hash::DigestKind;
use crate::cache::piece::CacheState;
use crate::cache::{AddDirty, AllocatePending, CacheRead, FlushPlan, KickHash};
use crate::disk::job::DiskJob;
use crate::disk::pool::{JobQueues, HASHER_THREAD_ID};
use crate::disk::storage::ResumeData;
use crate::disk::tasks::context::{job_is_fence_exempt, DiskManagerContext};
use crate::disk::{DiskOperation, FileFlags, ODiskMessage};
use crate::error::{
    BlockError, BlockErrorKind, TorrentError, TorrentErrorKind,
};
use crate::memory::block::{Block, BlockMut};
use crate::BLOCK_SIZE;

use bep_util::bt::InfoHash;
use futures::sink::Wait;
use futures::sync::mpsc::Sender;

pub mod context;

/// Seconds between expired write block scans on thread zero.
const EXPIRY_SCAN_INTERVAL_SECS: u64 = 5;

/// Pieces flushed per expiry pass, bounds scan latency.
const EXPIRY_FLUSH_PIECE_LIMIT: usize = 200;

/// Millis slept while waiting for the user to return pinned blocks.
const PINNED_WAIT_SLEEP_MILLIS: u64 = 50;

type BlockingSender = Wait<Sender<ODiskMessage>>;

/// Outcome of one handler invocation.
pub enum HandlerResult {
    /// Job finished, completions were posted.
    Done,
    /// Job could not run yet, re queue it at the tail and yield.
    Retry(DiskJob),
    /// Job was parked on a piece; a later cache event completes it.
    Deferred,
}

//----------------------------------------------------------------------------//

/// Main loop of one disk worker thread.
pub fn run_worker<F>(thread_id: usize, context: DiskManagerContext<F>, queues: Arc<JobQueues>)
where
    F: crate::disk::fs::FileSystem + Send + Sync + 'static,
{
    let is_hasher = thread_id == HASHER_THREAD_ID && queues.has_hasher();
    let mut sender = context.blocking_sender();
    let mut last_expiry_scan = Instant::now();

    loop {
        let opt_job = if is_hasher { queues.pop_hash() } else { queues.pop_general() };

        if let Some(job) = opt_job {
            context.run_with_cache(|cache| cache.level_check());

            let storage = job.storage();
            let is_fence = job.is_fence();
            let counted = !is_fence && storage.is_some() && !job_is_fence_exempt(&job);

            let retried = match execute(job, &context, &queues, &mut sender) {
                HandlerResult::Retry(job) => {
                    queues.push_back(job);
                    thread::yield_now();
                    true
                }
                HandlerResult::Done | HandlerResult::Deferred => false,
            };

            // A retried job stays logically outstanding.
            if !retried {
                if let Some(hash) = storage {
                    if is_fence {
                        context.fence_finished(hash, &queues);
                    } else if counted {
                        context.job_finished(hash, &queues);
                    }
                }
            }
        } else if queues.is_shutdown() && queues.is_empty() {
            break;
        }

        if thread_id == 0 && last_expiry_scan.elapsed() >= Duration::from_secs(EXPIRY_SCAN_INTERVAL_SECS) {
            flush_expired_blocks(&context, &queues, &mut sender);
            last_expiry_scan = Instant::now();
        }
    }

    if queues.worker_exited() {
        shutdown_cleanup(&context, &queues, &mut sender);
    }
}

/// Dispatch one job to its handler.
pub fn execute<F>(
    job: DiskJob,
    context: &DiskManagerContext<F>,
    queues: &JobQueues,
    sender: &mut BlockingSender,
) -> HandlerResult
where
    F: crate::disk::fs::FileSystem,
{
    let mut completions = Vec::new();

    let result = match job {
        DiskJob::AddTorrent(layout) => execute_add_torrent(layout, context, &mut completions),
        DiskJob::StopTorrent(hash) => execute_stop_torrent(hash, context, queues, &mut completions),
        DiskJob::LoadBlock { block, flags } => execute_load_block(block, flags, context, queues, &mut completions),
        DiskJob::ProcessBlock { block, flags } => {
            execute_process_block(block, flags, context, queues, &mut completions)
        }
        DiskJob::HashPiece { hash, piece } => execute_hash_piece(hash, piece, context, queues, &mut completions),
        DiskJob::CachePiece { hash, piece } => execute_cache_piece(hash, piece, context, queues, &mut completions),
        DiskJob::FlushPiece { hash, piece } => {
            execute_flush_piece(hash, piece, context, queues, &mut completions);
            HandlerResult::Done
        }
        DiskJob::FlushHashed { hash, piece } => {
            execute_flush_hashed(hash, piece, context, queues, &mut completions);
            HandlerResult::Done
        }
        DiskJob::FlushStorage { hash, internal } => {
            execute_flush_storage(hash, internal, context, queues, &mut completions);
            HandlerResult::Done
        }
        DiskJob::TrimCache => {
            let freed = context.run_with_cache(|cache| cache.trim());
            completions.push(ODiskMessage::CacheTrimmed(freed));
            HandlerResult::Done
        }
        DiskJob::MoveStorage { hash, new_dir } => {
            execute_move_storage(hash, new_dir, context, queues, &mut completions);
            HandlerResult::Done
        }
        DiskJob::RenameFile { hash, index, new_name } => {
            execute_rename_file(hash, index, new_name, context, &mut completions);
            HandlerResult::Done
        }
        DiskJob::DeleteFiles { hash } => {
            execute_delete_files(hash, context, &mut completions);
            HandlerResult::Done
        }
        DiskJob::ReleaseFiles { hash } => {
            execute_release_files(hash, context, queues, &mut completions);
            HandlerResult::Done
        }
        DiskJob::CheckFastresume { hash, resume } => {
            execute_check_fastresume(hash, resume, context, &mut completions);
            HandlerResult::Done
        }
        DiskJob::SaveResumeData { hash } => {
            execute_save_resume_data(hash, context, &mut completions);
            HandlerResult::Done
        }
        DiskJob::SetFilePriority { hash, priorities } => {
            execute_set_file_priority(hash, priorities, context, &mut completions);
            HandlerResult::Done
        }
        DiskJob::ClearPiece { hash, piece } => {
            execute_clear_piece(hash, piece, context, &mut completions);
            HandlerResult::Done
        }
        DiskJob::Tick { hash } => {
            let _ = context.update_torrent(hash, |entry| entry.storage.tick());
            HandlerResult::Done
        }
    };

    for msg in completions {
        sender
            .send(msg)
            .expect("bep_disk: Failed To Send Out Message In execute");
    }
    sender.flush().expect("bep_disk: Failed To Flush Out Messages In execute");

    result
}

//----------------------------------------------------------------------------//

fn execute_add_torrent<F>(
    layout: crate::disk::storage::StorageLayout,
    context: &DiskManagerContext<F>,
    completions: &mut Vec<ODiskMessage>,
) -> HandlerResult
where
    F: crate::disk::fs::FileSystem,
{
    let hash = *layout.info_hash();

    if !context.insert_torrent(layout) {
        completions.push(ODiskMessage::TorrentError(
            hash,
            DiskOperation::AddTorrent,
            TorrentError::from_kind(TorrentErrorKind::ExistingInfoHash { hash }),
        ));
        return HandlerResult::Done;
    }

    let validated = context
        .update_torrent(hash, |entry| entry.storage.validate_file_sizes())
        .expect("bep_disk: Freshly Added Torrent Disappeared");

    match validated {
        Ok(()) => completions.push(ODiskMessage::TorrentAdded(hash)),
        Err(err) => {
            context.remove_torrent(hash);
            completions.push(ODiskMessage::TorrentError(hash, DiskOperation::AddTorrent, err));
        }
    }

    HandlerResult::Done
}

/// Piece geometry and digest for one torrent, read under the entry lock.
struct PieceParams {
    blocks_in_piece: usize,
    piece_len: usize,
    digest_kind: DigestKind,
}

fn piece_params<F>(context: &DiskManagerContext<F>, hash: InfoHash, piece: u64) -> Option<PieceParams>
where
    F: crate::disk::fs::FileSystem,
{
    context.update_torrent(hash, |entry| {
        let layout = entry.storage.layout();

        PieceParams {
            blocks_in_piece: layout.blocks_in_piece(piece),
            piece_len: layout.piece_size(piece),
            digest_kind: layout.digest_kind(),
        }
    })
}

fn execute_load_block<F>(
    mut block: BlockMut,
    flags: FileFlags,
    context: &DiskManagerContext<F>,
    queues: &JobQueues,
    completions: &mut Vec<ODiskMessage>,
) -> HandlerResult
where
    F: crate::disk::fs::FileSystem,
{
    let metadata = *block.metadata();
    let hash = *metadata.info_hash();
    let piece = metadata.piece_index();

    let params = match piece_params(context, hash, piece) {
        Some(params) => params,
        None => {
            completions.push(ODiskMessage::LoadBlockError(
                block,
                BlockError::from_kind(BlockErrorKind::InfoHashNotFound { hash }),
            ));
            return HandlerResult::Done;
        }
    };

    let cache_read = context.run_with_cache(|cache| cache.try_read(&metadata, true, &mut block[..]));
    if let CacheRead::Copied(_) = cache_read {
        completions.push(ODiskMessage::BlockLoaded(block));
        return HandlerResult::Done;
    }

    // Miss: reserve placeholders and read through the cache. A random
    // access hint marks the piece volatile, dropped after one use.
    let state = if flags.is_random_access() {
        CacheState::VolatileReadLru
    } else {
        CacheState::ReadLru1
    };

    let begin_block = metadata.block_offset() as usize / BLOCK_SIZE;
    let end_block = (metadata.block_offset() as usize + metadata.block_length() + BLOCK_SIZE - 1) / BLOCK_SIZE;

    enum LoadAttempt {
        Plan(crate::cache::ReadPlan),
        Raced(DiskJob),
        NoRoom(DiskJob),
    }

    let attempt = context.run_with_cache(|cache| {
        let index = cache.allocate_piece(
            (hash, piece),
            params.blocks_in_piece,
            params.piece_len,
            params.digest_kind,
            state,
        );

        match cache.allocate_pending(index, begin_block, end_block) {
            AllocatePending::Read(plan) => {
                cache.park_job(index, DiskJob::LoadBlock { block, flags });
                LoadAttempt::Plan(plan)
            }
            AllocatePending::Nothing => LoadAttempt::Raced(DiskJob::LoadBlock { block, flags }),
            AllocatePending::NoRoom => LoadAttempt::NoRoom(DiskJob::LoadBlock { block, flags }),
        }
    });

    let job = match attempt {
        LoadAttempt::Plan(mut plan) => {
            let result = read_plan_blocks(context, hash, piece, &mut plan, flags);

            let mut requeue = Vec::new();
            context.run_with_cache(|cache| cache.mark_read_done(plan, result, completions, &mut requeue));
            for job in requeue {
                context.add_job(job, queues);
            }

            return HandlerResult::Deferred;
        }
        // Raced with another fill, go around again.
        LoadAttempt::Raced(job) => return HandlerResult::Retry(job),
        LoadAttempt::NoRoom(job) => job,
    };

    // Fail open: the cache had no room, read directly from storage.
    let mut block = match job {
        DiskJob::LoadBlock { block, .. } => block,
        _ => unreachable!(),
    };

    let result = context
        .update_torrent(hash, |entry| {
            let mut bufs = [&mut block[..]];
            entry.storage.readv(&mut bufs, piece, metadata.block_offset(), flags).map(|_| ())
        })
        .unwrap_or_else(|| {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "Torrent Removed Mid Job"))
        });

    match result {
        Ok(()) => completions.push(ODiskMessage::BlockLoaded(block)),
        Err(err) => completions.push(ODiskMessage::LoadBlockError(block, BlockError::from(err))),
    }

    HandlerResult::Done
}

/// Read the blocks of a reserved plan into its buffers.
fn read_plan_blocks<F>(
    context: &DiskManagerContext<F>,
    hash: InfoHash,
    piece: u64,
    plan: &mut crate::cache::ReadPlan,
    flags: FileFlags,
) -> Result<(), std::io::Error>
where
    F: crate::disk::fs::FileSystem,
{
    let (begin, end) = (plan.begin, plan.end);

    context
        .update_torrent(hash, |entry| {
            let piece_len = entry.storage.layout().piece_size(piece);

            let mut bufs: Vec<&mut [u8]> = Vec::with_capacity(end - begin);
            for (block, buf) in (begin..end).zip(plan.buffers.iter_mut()) {
                let length = std::cmp::min(BLOCK_SIZE, piece_len - block * BLOCK_SIZE);
                bufs.push(&mut buf[..length]);
            }

            entry
                .storage
                .readv(&mut bufs[..], piece, (begin * BLOCK_SIZE) as u64, flags)
                .map(|_| ())
        })
        .unwrap_or_else(|| {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "Torrent Removed Mid Job"))
        })
}

fn execute_process_block<F>(
    block: Block,
    flags: FileFlags,
    context: &DiskManagerContext<F>,
    queues: &JobQueues,
    completions: &mut Vec<ODiskMessage>,
) -> HandlerResult
where
    F: crate::disk::fs::FileSystem,
{
    let metadata = *block.metadata();
    let hash = *metadata.info_hash();
    let piece = metadata.piece_index();

    let params = match piece_params(context, hash, piece) {
        Some(params) => params,
        None => {
            completions.push(ODiskMessage::ProcessBlockError(
                block,
                BlockError::from_kind(BlockErrorKind::InfoHashNotFound { hash }),
            ));
            return HandlerResult::Done;
        }
    };

    let added = context.run_with_cache(|cache| {
        cache.add_dirty_block(
            DiskJob::ProcessBlock { block, flags },
            params.blocks_in_piece,
            params.piece_len,
            params.digest_kind,
        )
    });

    match added {
        AddDirty::Queued => {
            // Hash as we go and schedule the deferred prefix flush.
            let index = context
                .run_with_cache(|cache| cache.find_piece(&(hash, piece)))
                .expect("bep_disk: Dirty Piece Disappeared");
            drive_hasher(context, index, completions);

            let schedule = context.run_with_cache(|cache| {
                cache.find_piece(&(hash, piece)).map_or(false, |index| cache.schedule_flush(index))
            });
            if schedule {
                context.add_job(DiskJob::FlushHashed { hash, piece }, queues);
            }

            HandlerResult::Deferred
        }
        AddDirty::Deferred => HandlerResult::Deferred,
        AddDirty::NoMemory(job) => {
            // Fail open: write directly to storage.
            let block = match job {
                DiskJob::ProcessBlock { block, .. } => block,
                _ => unreachable!(),
            };

            let result = context
                .update_torrent(hash, |entry| {
                    let bufs = [&block[..]];
                    entry.storage.writev(&bufs, piece, metadata.block_offset(), flags).map(|_| ())
                })
                .unwrap_or_else(|| {
                    Err(std::io::Error::new(std::io::ErrorKind::NotFound, "Torrent Removed Mid Job"))
                });

            match result {
                Ok(()) => completions.push(ODiskMessage::BlockProcessed(block)),
                Err(err) => completions.push(ODiskMessage::ProcessBlockError(block, BlockError::from(err))),
            }

            HandlerResult::Done
        }
    }
}

/// Advance the hash cursor of a piece as far as resident blocks allow.
///
/// Digesting happens with the cache lock released; block refcounts hold
/// the buffers in place meanwhile.
fn drive_hasher<F>(context: &DiskManagerContext<F>, index: usize, completions: &mut Vec<ODiskMessage>)
where
    F: crate::disk::fs::FileSystem,
{
    loop {
        let kick = context.run_with_cache(|cache| cache.kick_hasher(index));

        match kick {
            KickHash::Plan(mut plan) => {
                for buffer in plan.buffers.iter() {
                    plan.hash.update(buffer);
                }

                let more = context.run_with_cache(|cache| {
                    cache.complete_hash(plan.index, plan.begin, plan.end, plan.hash, completions)
                });
                if !more {
                    break;
                }
            }
            KickHash::Busy | KickHash::Blocked | KickHash::Done(_) => break,
        }
    }
}

fn execute_hash_piece<F>(
    hash: InfoHash,
    piece: u64,
    context: &DiskManagerContext<F>,
    queues: &JobQueues,
    completions: &mut Vec<ODiskMessage>,
) -> HandlerResult
where
    F: crate::disk::fs::FileSystem,
{
    let params = match piece_params(context, hash, piece) {
        Some(params) => params,
        None => {
            completions.push(ODiskMessage::TorrentError(
                hash,
                DiskOperation::Hash,
                TorrentError::from_kind(TorrentErrorKind::InfoHashNotFound { hash }),
            ));
            return HandlerResult::Done;
        }
    };

    // At most one hash computation per piece; a second job retries.
    let index = {
        let busy = context.run_with_cache(|cache| {
            let index = cache.allocate_piece(
                (hash, piece),
                params.blocks_in_piece,
                params.piece_len,
                params.digest_kind,
                CacheState::ReadLru1,
            );

            if cache.is_hashing(index) {
                None
            } else {
                cache.park_job(index, DiskJob::HashPiece { hash, piece });
                Some(index)
            }
        });

        match busy {
            Some(index) => index,
            None => return HandlerResult::Retry(DiskJob::HashPiece { hash, piece }),
        }
    };

    loop {
        let kick = context.run_with_cache(|cache| cache.kick_hasher(index));

        match kick {
            KickHash::Plan(mut plan) => {
                for buffer in plan.buffers.iter() {
                    plan.hash.update(buffer);
                }

                let more = context.run_with_cache(|cache| {
                    cache.complete_hash(plan.index, plan.begin, plan.end, plan.hash, completions)
                });
                if !more {
                    // complete_hash finalized the parked hash jobs.
                    return HandlerResult::Deferred;
                }
            }
            KickHash::Done(digest) => {
                let finalized = context.run_with_cache(|cache| cache.take_hash_jobs(index));
                for _ in finalized {
                    completions.push(ODiskMessage::PieceHashed(hash, piece, digest));
                }
                return HandlerResult::Done;
            }
            KickHash::Busy => {
                // Raced with another worker, our parked job finishes there.
                return HandlerResult::Deferred;
            }
            KickHash::Blocked => {
                // Missing blocks, read them back through the cache.
                let cursor_block = context.run_with_cache(|cache| {
                    cache.allocate_pending(index, 0, params.blocks_in_piece)
                });

                match cursor_block {
                    AllocatePending::Read(mut plan) => {
                        let result = read_plan_blocks(context, hash, piece, &mut plan, FileFlags::sequential());

                        let mut requeue = Vec::new();
                        let failed = result.is_err();
                        context.run_with_cache(|cache| {
                            cache.mark_read_done(plan, result, completions, &mut requeue)
                        });
                        for job in requeue {
                            context.add_job(job, queues);
                        }

                        if failed {
                            // mark_read_done already failed the parked jobs.
                            return HandlerResult::Done;
                        }
                        // Our parked job was requeued with the read, the
                        // requeued copy continues the pass.
                        return HandlerResult::Deferred;
                    }
                    AllocatePending::Nothing => {
                        // Another worker holds the read in flight; the
                        // requeue on its completion resumes this job.
                        return HandlerResult::Deferred;
                    }
                    AllocatePending::NoRoom => {
                        // Fail open: hash the piece with transient buffers.
                        let digest = direct_hash_piece(context, hash, piece, &params);
                        let finalized = context.run_with_cache(|cache| cache.take_hash_jobs(index));

                        match digest {
                            Ok(digest) => {
                                for _ in finalized {
                                    completions.push(ODiskMessage::PieceHashed(hash, piece, digest));
                                }
                            }
                            Err(err) => {
                                completions.push(ODiskMessage::TorrentError(
                                    hash,
                                    DiskOperation::Hash,
                                    TorrentError::from(err),
                                ));
                            }
                        }
                        return HandlerResult::Done;
                    }
                }
            }
        }
    }
}

/// Hash an entire piece through transient buffers, uncached fallback.
fn direct_hash_piece<F>(
    context: &DiskManagerContext<F>,
    hash: InfoHash,
    piece: u64,
    params: &PieceParams,
) -> Result<crate::cache::hash::PieceHash, std::io::Error>
where
    F: crate::disk::fs::FileSystem,
{
    use crate::cache::hash::PartialHash;

    let mut partial = PartialHash::new(params.digest_kind);
    let mut buffer = context.buffer_pool().alloc_direct();

    for block in 0..params.blocks_in_piece {
        let length = std::cmp::min(BLOCK_SIZE, params.piece_len - block * BLOCK_SIZE);

        context
            .update_torrent(hash, |entry| {
                let mut bufs = [&mut buffer[..length]];
                entry
                    .storage
                    .readv(&mut bufs, piece, (block * BLOCK_SIZE) as u64, FileFlags::sequential())
                    .map(|_| ())
            })
            .unwrap_or_else(|| {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "Torrent Removed Mid Job"))
            })?;

        partial.update(&buffer[..length]);
    }

    Ok(partial.finish())
}

fn execute_cache_piece<F>(
    hash: InfoHash,
    piece: u64,
    context: &DiskManagerContext<F>,
    queues: &JobQueues,
    completions: &mut Vec<ODiskMessage>,
) -> HandlerResult
where
    F: crate::disk::fs::FileSystem,
{
    let params = match piece_params(context, hash, piece) {
        Some(params) => params,
        None => {
            completions.push(ODiskMessage::TorrentError(
                hash,
                DiskOperation::CachePiece,
                TorrentError::from_kind(TorrentErrorKind::InfoHashNotFound { hash }),
            ));
            return HandlerResult::Done;
        }
    };

    let allocated = context.run_with_cache(|cache| {
        let index = cache.allocate_piece(
            (hash, piece),
            params.blocks_in_piece,
            params.piece_len,
            params.digest_kind,
            CacheState::ReadLru1,
        );

        cache.allocate_pending(index, 0, params.blocks_in_piece)
    });

    match allocated {
        AllocatePending::Read(mut plan) => {
            let result = read_plan_blocks(context, hash, piece, &mut plan, FileFlags::sequential());
            let failed = result.is_err();

            let mut requeue = Vec::new();
            context.run_with_cache(|cache| cache.mark_read_done(plan, result, completions, &mut requeue));
            for job in requeue {
                context.add_job(job, queues);
            }

            if !failed {
                completions.push(ODiskMessage::PieceCached(hash, piece));
            } else {
                completions.push(ODiskMessage::TorrentError(
                    hash,
                    DiskOperation::CachePiece,
                    TorrentError::from_kind(TorrentErrorKind::Msg("Cache Piece Read Failed".to_string())),
                ));
            }
        }
        AllocatePending::Nothing => completions.push(ODiskMessage::PieceCached(hash, piece)),
        AllocatePending::NoRoom => {
            completions.push(ODiskMessage::TorrentError(
                hash,
                DiskOperation::CachePiece,
                TorrentError::from_kind(TorrentErrorKind::CacheCapacity),
            ));
        }
    }

    HandlerResult::Done
}

//----------------------------------------------------------------------------//

/// Write out a batch of flush plans and record their outcomes.
fn perform_flush_plans<F>(
    context: &DiskManagerContext<F>,
    queues: &JobQueues,
    plans: Vec<FlushPlan>,
    completions: &mut Vec<ODiskMessage>,
) where
    F: crate::disk::fs::FileSystem,
{
    for plan in plans {
        let (hash, piece) = plan.key;

        let result = {
            let bufs: Vec<&[u8]> = plan.buffers.iter().map(|buffer| &buffer[..]).collect();

            context
                .update_torrent(hash, |entry| {
                    entry
                        .storage
                        .writev(&bufs[..], piece, (plan.begin * BLOCK_SIZE) as u64, FileFlags::coalesce_buffers())
                        .map(|_| ())
                })
                .unwrap_or_else(|| {
                    Err(std::io::Error::new(std::io::ErrorKind::NotFound, "Torrent Removed Mid Job"))
                })
        };

        let mut requeue = Vec::new();
        context.run_with_cache(|cache| cache.mark_flush_done(&plan, result, completions, &mut requeue));
        for job in requeue {
            context.add_job(job, queues);
        }
    }
}

fn execute_flush_piece<F>(
    hash: InfoHash,
    piece: u64,
    context: &DiskManagerContext<F>,
    queues: &JobQueues,
    completions: &mut Vec<ODiskMessage>,
) where
    F: crate::disk::fs::FileSystem,
{
    let plans = context.run_with_cache(|cache| {
        cache.find_piece(&(hash, piece)).map(|index| cache.collect_flush_plans(index)).unwrap_or_default()
    });

    perform_flush_plans(context, queues, plans, completions);
    completions.push(ODiskMessage::PieceFlushed(hash, piece));
}

fn execute_flush_hashed<F>(
    hash: InfoHash,
    piece: u64,
    context: &DiskManagerContext<F>,
    queues: &JobQueues,
    completions: &mut Vec<ODiskMessage>,
) where
    F: crate::disk::fs::FileSystem,
{
    let settings = *context.settings();
    let blocks_in_piece = piece_params(context, hash, piece).map(|params| params.blocks_in_piece);

    let plans = context.run_with_cache(|cache| {
        let index = match cache.find_piece(&(hash, piece)) {
            Some(index) => index,
            None => return Vec::new(),
        };
        cache.clear_outstanding_flush(index);

        let cont_block = settings.read_line_size;
        let blocks_in_piece = blocks_in_piece.unwrap_or(cont_block);

        // Stripe mode only engages past a single piece's span.
        if settings.coalesce_piece_flush && cont_block > blocks_in_piece {
            cache.try_flush_stripe(index, cont_block)
        } else {
            cache.try_flush_hashed(index, cont_block).into_iter().collect()
        }
    });

    perform_flush_plans(context, queues, plans, completions);
}

fn execute_flush_storage<F>(
    hash: InfoHash,
    internal: bool,
    context: &DiskManagerContext<F>,
    queues: &JobQueues,
    completions: &mut Vec<ODiskMessage>,
) where
    F: crate::disk::fs::FileSystem,
{
    let plans = context.run_with_cache(|cache| {
        let mut plans = Vec::new();
        for index in cache.storage_pieces(&hash) {
            plans.extend(cache.collect_flush_plans(index));
        }
        plans
    });

    perform_flush_plans(context, queues, plans, completions);

    if !internal {
        completions.push(ODiskMessage::StorageFlushed(hash));
    }
}

//----------------------------------------------------------------------------//

fn execute_move_storage<F>(
    hash: InfoHash,
    new_dir: PathBuf,
    context: &DiskManagerContext<F>,
    queues: &JobQueues,
    completions: &mut Vec<ODiskMessage>,
) where
    F: crate::disk::fs::FileSystem,
{
    execute_flush_storage(hash, true, context, queues, completions);

    let moved = context.update_torrent(hash, |entry| entry.storage.move_storage(new_dir.clone()));
    match moved {
        Some(Ok(())) => completions.push(ODiskMessage::TorrentMoved(hash, new_dir)),
        Some(Err(err)) => completions.push(ODiskMessage::TorrentError(hash, DiskOperation::MoveStorage, err)),
        None => completions.push(ODiskMessage::TorrentError(
            hash,
            DiskOperation::MoveStorage,
            TorrentError::from_kind(TorrentErrorKind::InfoHashNotFound { hash }),
        )),
    }
}

fn execute_rename_file<F>(
    hash: InfoHash,
    index: usize,
    new_name: PathBuf,
    context: &DiskManagerContext<F>,
    completions: &mut Vec<ODiskMessage>,
) where
    F: crate::disk::fs::FileSystem,
{
    let renamed = context.update_torrent(hash, |entry| entry.storage.rename_file(index, new_name.clone()));
    match renamed {
        Some(Ok(())) => completions.push(ODiskMessage::FileRenamed(hash, index, new_name)),
        Some(Err(err)) => completions.push(ODiskMessage::TorrentError(hash, DiskOperation::RenameFile, err)),
        None => completions.push(ODiskMessage::TorrentError(
            hash,
            DiskOperation::RenameFile,
            TorrentError::from_kind(TorrentErrorKind::InfoHashNotFound { hash }),
        )),
    }
}

fn execute_delete_files<F>(hash: InfoHash, context: &DiskManagerContext<F>, completions: &mut Vec<ODiskMessage>)
where
    F: crate::disk::fs::FileSystem,
{
    // Dirty blocks are discarded, not flushed; delete wins over writes.
    context.run_with_cache(|cache| cache.abort_storage(&hash, completions));

    let deleted = context.update_torrent(hash, |entry| entry.storage.delete_files());
    match deleted {
        Some(Ok(())) => completions.push(ODiskMessage::FilesDeleted(hash)),
        Some(Err(err)) => completions.push(ODiskMessage::TorrentError(hash, DiskOperation::DeleteFiles, err)),
        None => completions.push(ODiskMessage::TorrentError(
            hash,
            DiskOperation::DeleteFiles,
            TorrentError::from_kind(TorrentErrorKind::InfoHashNotFound { hash }),
        )),
    }
}

fn execute_release_files<F>(
    hash: InfoHash,
    context: &DiskManagerContext<F>,
    queues: &JobQueues,
    completions: &mut Vec<ODiskMessage>,
) where
    F: crate::disk::fs::FileSystem,
{
    execute_flush_storage(hash, true, context, queues, completions);

    let released = context.update_torrent(hash, |entry| entry.storage.release_files());
    match released {
        Some(()) => completions.push(ODiskMessage::FilesReleased(hash)),
        None => completions.push(ODiskMessage::TorrentError(
            hash,
            DiskOperation::ReleaseFiles,
            TorrentError::from_kind(TorrentErrorKind::InfoHashNotFound { hash }),
        )),
    }
}

fn execute_stop_torrent<F>(
    hash: InfoHash,
    context: &DiskManagerContext<F>,
    queues: &JobQueues,
    completions: &mut Vec<ODiskMessage>,
) -> HandlerResult
where
    F: crate::disk::fs::FileSystem,
{
    execute_flush_storage(hash, true, context, queues, completions);
    context.run_with_cache(|cache| cache.abort_storage(&hash, completions));

    match context.remove_torrent(hash) {
        Some(mut entry) => {
            for job in entry.fence.drain() {
                if let Some(msg) = job.into_aborted() {
                    completions.push(msg);
                }
            }
            entry.storage.release_files();

            completions.push(ODiskMessage::TorrentRemoved(hash));
        }
        None => completions.push(ODiskMessage::TorrentError(
            hash,
            DiskOperation::StopTorrent,
            TorrentError::from_kind(TorrentErrorKind::InfoHashNotFound { hash }),
        )),
    }

    HandlerResult::Done
}

fn execute_check_fastresume<F>(
    hash: InfoHash,
    resume: ResumeData,
    context: &DiskManagerContext<F>,
    completions: &mut Vec<ODiskMessage>,
) where
    F: crate::disk::fs::FileSystem,
{
    let checked = context.update_torrent(hash, |entry| entry.storage.check_fastresume(&resume));
    match checked {
        Some(Ok(status)) => completions.push(ODiskMessage::FastresumeChecked(hash, status)),
        Some(Err(err)) => completions.push(ODiskMessage::TorrentError(hash, DiskOperation::CheckFastresume, err)),
        None => completions.push(ODiskMessage::TorrentError(
            hash,
            DiskOperation::CheckFastresume,
            TorrentError::from_kind(TorrentErrorKind::InfoHashNotFound { hash }),
        )),
    }
}

fn execute_save_resume_data<F>(hash: InfoHash, context: &DiskManagerContext<F>, completions: &mut Vec<ODiskMessage>)
where
    F: crate::disk::fs::FileSystem,
{
    let saved = context.update_torrent(hash, |entry| entry.storage.write_resume_data());
    match saved {
        Some(Ok(resume)) => completions.push(ODiskMessage::ResumeDataSaved(hash, resume)),
        Some(Err(err)) => completions.push(ODiskMessage::TorrentError(hash, DiskOperation::SaveResumeData, err)),
        None => completions.push(ODiskMessage::TorrentError(
            hash,
            DiskOperation::SaveResumeData,
            TorrentError::from_kind(TorrentErrorKind::InfoHashNotFound { hash }),
        )),
    }
}

fn execute_set_file_priority<F>(
    hash: InfoHash,
    priorities: Vec<u8>,
    context: &DiskManagerContext<F>,
    completions: &mut Vec<ODiskMessage>,
) where
    F: crate::disk::fs::FileSystem,
{
    let updated = context.update_torrent(hash, |entry| entry.storage.set_file_priority(priorities));
    match updated {
        Some(Ok(())) => completions.push(ODiskMessage::FilePrioritySet(hash)),
        Some(Err(err)) => completions.push(ODiskMessage::TorrentError(hash, DiskOperation::FilePriority, err)),
        None => completions.push(ODiskMessage::TorrentError(
            hash,
            DiskOperation::FilePriority,
            TorrentError::from_kind(TorrentErrorKind::InfoHashNotFound { hash }),
        )),
    }
}

fn execute_clear_piece<F>(hash: InfoHash, piece: u64, context: &DiskManagerContext<F>, completions: &mut Vec<ODiskMessage>)
where
    F: crate::disk::fs::FileSystem,
{
    context.run_with_cache(|cache| {
        if let Some(index) = cache.find_piece(&(hash, piece)) {
            cache.clear_piece(index, completions);
        }
    });

    completions.push(ODiskMessage::PieceCleared(hash, piece));
}

//----------------------------------------------------------------------------//

/// Flush write pieces that have sat dirty past the cache expiry.
fn flush_expired_blocks<F>(context: &DiskManagerContext<F>, queues: &JobQueues, sender: &mut BlockingSender)
where
    F: crate::disk::fs::FileSystem,
{
    let expiry = Duration::from_secs(context.settings().cache_expiry_secs);
    let plans = context
        .run_with_cache(|cache| cache.flush_expired(Instant::now(), expiry, EXPIRY_FLUSH_PIECE_LIMIT));

    if plans.is_empty() {
        return;
    }
    info!("Flushing {} Expired Write Runs", plans.len());

    let mut completions = Vec::new();
    perform_flush_plans(context, queues, plans, &mut completions);

    for msg in completions {
        sender.send(msg).expect("bep_disk: Failed To Send Expired Flush Completion");
    }
    sender.flush().expect("bep_disk: Failed To Flush Expired Flush Completions");
}

/// Last worker out: wait for pins, flush, clear, and fail the stragglers.
fn shutdown_cleanup<F>(context: &DiskManagerContext<F>, queues: &Arc<JobQueues>, sender: &mut BlockingSender)
where
    F: crate::disk::fs::FileSystem,
{
    info!("Last Disk Worker Draining For Shutdown");

    // The user layer still holds block references, wait them out.
    while context.run_with_cache(|cache| cache.pinned_blocks()) > 0 {
        thread::sleep(Duration::from_millis(PINNED_WAIT_SLEEP_MILLIS));
    }

    let mut completions = Vec::new();

    for hash in context.torrent_hashes() {
        execute_flush_storage(hash, true, context, queues, &mut completions);
    }

    context.run_with_cache(|cache| cache.clear(&mut completions));

    while let Some(job) = queues.try_pop_any() {
        if let Some(msg) = job.into_aborted() {
            completions.push(msg);
        }
    }

    for hash in context.torrent_hashes() {
        let drained = context.update_torrent(hash, |entry| {
            let jobs = entry.fence.drain();
            entry.storage.release_files();
            jobs
        });
        for job in drained.into_iter().flatten() {
            if let Some(msg) = job.into_aborted() {
                completions.push(msg);
            }
        }
    }

    for msg in completions {
        sender.send(msg).expect("bep_disk: Failed To Send Shutdown Completion");
    }
    sender.flush().expect("bep_disk: Failed To Flush Shutdown Completions");
}
