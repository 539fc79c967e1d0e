use std::collections::VecDeque;

use crate::disk::job::DiskJob;

/// Outcome of raising a fence on a storage.
pub enum RaiseFence {
    /// Nothing outstanding, the fence job may run immediately.
    PostFence(DiskJob),
    /// Work is outstanding; an internal flush must drain ahead of the
    /// fence job, which stays parked here until the storage quiesces.
    PostFlush,
}

/// Per storage barrier serializing I/O around mutating operations.
///
/// While a fence is raised every non fence job for the storage is held in
/// the blocked queue. The fence job itself runs once the outstanding job
/// count drains to zero, and lowering the fence re admits the held jobs.
#[derive(Default)]
pub struct StorageFence {
    /// Jobs for this storage currently queued or executing.
    outstanding: usize,
    /// True while an admitted fence job is queued or running.
    active_fence: bool,
    /// Fence jobs waiting behind the active one.
    fence_jobs: VecDeque<DiskJob>,
    /// Non fence jobs held until the fence lowers.
    blocked: VecDeque<DiskJob>,
}

impl StorageFence {
    pub fn new() -> StorageFence {
        StorageFence::default()
    }

    /// True if a fence is currently raised on this storage.
    pub fn is_raised(&self) -> bool {
        self.active_fence || !self.fence_jobs.is_empty()
    }

    /// Number of blocked jobs currently held.
    pub fn num_blocked(&self) -> usize {
        self.blocked.len()
    }

    /// Record a normal job entering the queue for this storage.
    pub fn job_queued(&mut self) {
        self.outstanding += 1;
    }

    /// Raise the fence with the given fence job.
    ///
    /// `cache_work` reports whether the block cache still holds dirty or
    /// parked state for the storage, which counts as outstanding writes.
    pub fn raise_fence(&mut self, job: DiskJob, cache_work: bool) -> RaiseFence {
        debug_assert!(job.is_fence());

        if self.outstanding == 0 && !cache_work && !self.is_raised() {
            self.active_fence = true;

            RaiseFence::PostFence(job)
        } else {
            self.fence_jobs.push_back(job);

            RaiseFence::PostFlush
        }
    }

    /// Hold a non fence job until the fence lowers.
    pub fn block_job(&mut self, job: DiskJob) {
        debug_assert!(self.is_raised());

        self.blocked.push_back(job);
    }

    /// Record a normal job leaving execution.
    ///
    /// When the storage quiesces behind a raised fence, the fence job is
    /// handed back to be pushed at the front of the queue.
    pub fn job_finished(&mut self) -> Option<DiskJob> {
        if self.outstanding > 0 {
            self.outstanding -= 1;
        }

        self.try_admit_fence()
    }

    /// Admit the next fence job if the storage has quiesced.
    pub fn try_admit_fence(&mut self) -> Option<DiskJob> {
        if self.outstanding == 0 && !self.active_fence {
            self.fence_jobs.pop_front().map(|job| {
                self.active_fence = true;
                job
            })
        } else {
            None
        }
    }

    /// Lower the fence after its job completed.
    ///
    /// Returns the next admitted fence job, if one was queued behind, and
    /// the jobs to re admit once no fence remains.
    pub fn fence_finished(&mut self) -> (Option<DiskJob>, Vec<DiskJob>) {
        debug_assert!(self.active_fence);
        self.active_fence = false;

        if let Some(next_fence) = self.try_admit_fence() {
            (Some(next_fence), Vec::new())
        } else if self.is_raised() {
            (None, Vec::new())
        } else {
            // Unblocked jobs are re submitted through the normal path, which
            // re counts them as outstanding.
            (None, self.blocked.drain(..).collect())
        }
    }

    /// Drain every held job, used when the storage is being torn down.
    pub fn drain(&mut self) -> Vec<DiskJob> {
        self.active_fence = false;

        self.fence_jobs.drain(..).chain(self.blocked.drain(..)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{RaiseFence, StorageFence};
    use crate::disk::job::DiskJob;

    fn fence_job() -> DiskJob {
        DiskJob::DeleteFiles { hash: [0u8; 20].into() }
    }

    fn normal_job() -> DiskJob {
        DiskJob::SaveResumeData { hash: [0u8; 20].into() }
    }

    #[test]
    fn positive_fence_posts_immediately_when_idle() {
        let mut fence = StorageFence::new();

        match fence.raise_fence(fence_job(), false) {
            RaiseFence::PostFence(_) => {}
            RaiseFence::PostFlush => panic!("Expected Immediate Fence"),
        }
        assert!(fence.is_raised());
    }

    #[test]
    fn positive_fence_waits_for_outstanding() {
        let mut fence = StorageFence::new();

        fence.job_queued();
        match fence.raise_fence(fence_job(), false) {
            RaiseFence::PostFlush => {}
            RaiseFence::PostFence(_) => panic!("Expected Parked Fence"),
        }

        // Finishing the outstanding job admits the fence.
        assert!(fence.job_finished().is_some());
    }

    #[test]
    fn positive_fence_waits_for_cache_work() {
        let mut fence = StorageFence::new();

        match fence.raise_fence(fence_job(), true) {
            RaiseFence::PostFlush => {}
            RaiseFence::PostFence(_) => panic!("Expected Parked Fence"),
        }
    }

    #[test]
    fn positive_blocked_jobs_readmitted_on_lower() {
        let mut fence = StorageFence::new();

        match fence.raise_fence(fence_job(), false) {
            RaiseFence::PostFence(_) => {}
            RaiseFence::PostFlush => panic!("Expected Immediate Fence"),
        }
        fence.block_job(normal_job());
        fence.block_job(normal_job());

        let (next_fence, unblocked) = fence.fence_finished();
        assert!(next_fence.is_none());
        assert_eq!(2, unblocked.len());
        assert!(!fence.is_raised());
    }

    #[test]
    fn positive_stacked_fences_run_in_order() {
        let mut fence = StorageFence::new();

        match fence.raise_fence(fence_job(), false) {
            RaiseFence::PostFence(_) => {}
            RaiseFence::PostFlush => panic!("Expected Immediate Fence"),
        }
        match fence.raise_fence(fence_job(), false) {
            RaiseFence::PostFlush => {}
            RaiseFence::PostFence(_) => panic!("Expected Parked Second Fence"),
        }

        let (next_fence, unblocked) = fence.fence_finished();
        assert!(next_fence.is_some());
        assert!(unblocked.is_empty());
        assert!(fence.is_raised());
    }
}
