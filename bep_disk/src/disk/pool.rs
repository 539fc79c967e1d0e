use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::disk::job::DiskJob;

use futures::task::Task;

/// How long a worker sleeps on an empty queue before re checking for
/// shutdown and, on thread zero, running maintenance.
const WORKER_WAIT_TIMEOUT_MILLIS: u64 = 1000;

/// Thread id of the dedicated hasher when enough threads exist.
pub const HASHER_THREAD_ID: usize = 3;

/// Minimum worker count for the dedicated hash queue to be active.
pub const HASHER_THREAD_MIN: usize = 4;

/// The two job queues feeding the disk workers.
///
/// Hash jobs route to the dedicated hash queue when at least four workers
/// exist, everything else lands on the general queue. One condvar per
/// queue wakes the matching workers.
pub struct JobQueues {
    general: Mutex<VecDeque<DiskJob>>,
    general_signal: Condvar,
    hash: Mutex<VecDeque<DiskJob>>,
    hash_signal: Condvar,
    num_threads: usize,
    target_threads: AtomicUsize,
    active_threads: AtomicUsize,
    queued_jobs: AtomicUsize,
    max_queued_jobs: usize,
    parked_senders: Mutex<Vec<Task>>,
}

impl JobQueues {
    pub fn new(num_threads: usize, max_queued_jobs: usize) -> JobQueues {
        JobQueues {
            general: Mutex::new(VecDeque::new()),
            general_signal: Condvar::new(),
            hash: Mutex::new(VecDeque::new()),
            hash_signal: Condvar::new(),
            num_threads,
            target_threads: AtomicUsize::new(num_threads),
            active_threads: AtomicUsize::new(num_threads),
            queued_jobs: AtomicUsize::new(0),
            max_queued_jobs,
            parked_senders: Mutex::new(Vec::new()),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// True when the dedicated hasher thread is in play.
    pub fn has_hasher(&self) -> bool {
        self.num_threads >= HASHER_THREAD_MIN
    }

    /// Queue a job at the tail of whichever queue it belongs on.
    pub fn push_back(&self, job: DiskJob) {
        if job.is_hash() && self.has_hasher() {
            self.push_back_hash(job);
        } else {
            self.push_back_general(job);
        }
    }

    pub fn push_back_general(&self, job: DiskJob) {
        let mut queue = self.general.lock().expect("bep_disk: JobQueues Poisoned General Queue");
        queue.push_back(job);
        self.queued_jobs.fetch_add(1, Ordering::AcqRel);

        self.general_signal.notify_one();
    }

    /// Queue a job at the front of the general queue, ahead of everything.
    pub fn push_front_general(&self, job: DiskJob) {
        let mut queue = self.general.lock().expect("bep_disk: JobQueues Poisoned General Queue");
        queue.push_front(job);
        self.queued_jobs.fetch_add(1, Ordering::AcqRel);

        self.general_signal.notify_one();
    }

    fn push_back_hash(&self, job: DiskJob) {
        let mut queue = self.hash.lock().expect("bep_disk: JobQueues Poisoned Hash Queue");
        queue.push_back(job);
        self.queued_jobs.fetch_add(1, Ordering::AcqRel);

        self.hash_signal.notify_one();
    }

    /// Wait for a job on the general queue.
    pub fn pop_general(&self) -> Option<DiskJob> {
        self.pop(&self.general, &self.general_signal)
    }

    /// Wait for a job on the hash queue.
    pub fn pop_hash(&self) -> Option<DiskJob> {
        self.pop(&self.hash, &self.hash_signal)
    }

    fn pop(&self, queue: &Mutex<VecDeque<DiskJob>>, signal: &Condvar) -> Option<DiskJob> {
        let mut queue = queue.lock().expect("bep_disk: JobQueues Poisoned Queue");

        loop {
            if let Some(job) = queue.pop_front() {
                self.queued_jobs.fetch_sub(1, Ordering::AcqRel);
                self.notify_parked_senders();

                return Some(job);
            }
            if self.is_shutdown() {
                return None;
            }

            let (guard, timeout) = signal
                .wait_timeout(queue, Duration::from_millis(WORKER_WAIT_TIMEOUT_MILLIS))
                .expect("bep_disk: JobQueues Poisoned Queue");
            queue = guard;

            if timeout.timed_out() {
                // Let the caller run maintenance and shutdown checks.
                return queue.pop_front().map(|job| {
                    self.queued_jobs.fetch_sub(1, Ordering::AcqRel);
                    self.notify_parked_senders();
                    job
                });
            }
        }
    }

    /// Drain one job from either queue without waiting, shutdown path.
    pub fn try_pop_any(&self) -> Option<DiskJob> {
        {
            let mut queue = self.general.lock().expect("bep_disk: JobQueues Poisoned General Queue");
            if let Some(job) = queue.pop_front() {
                self.queued_jobs.fetch_sub(1, Ordering::AcqRel);
                return Some(job);
            }
        }
        {
            let mut queue = self.hash.lock().expect("bep_disk: JobQueues Poisoned Hash Queue");
            if let Some(job) = queue.pop_front() {
                self.queued_jobs.fetch_sub(1, Ordering::AcqRel);
                return Some(job);
            }
        }

        None
    }

    /// True once every queued job has been drained.
    pub fn is_empty(&self) -> bool {
        self.queued_jobs.load(Ordering::Acquire) == 0
    }

    /// Backpressure check for the submission sink.
    pub fn can_submit(&self) -> bool {
        self.queued_jobs.load(Ordering::Acquire) < self.max_queued_jobs
    }

    /// Park the calling sink task until a job is drained.
    pub fn park_sender(&self, task: Task) {
        self.parked_senders
            .lock()
            .expect("bep_disk: JobQueues Poisoned Parked Senders")
            .push(task);
    }

    fn notify_parked_senders(&self) {
        let mut parked = self
            .parked_senders
            .lock()
            .expect("bep_disk: JobQueues Poisoned Parked Senders");

        for task in parked.drain(..) {
            task.notify();
        }
    }

    /// Request every worker to drain and exit.
    pub fn shutdown(&self) {
        self.target_threads.store(0, Ordering::Release);

        self.general_signal.notify_all();
        self.hash_signal.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.target_threads.load(Ordering::Acquire) == 0
    }

    /// Record a worker exiting; true for the last one out.
    pub fn worker_exited(&self) -> bool {
        self.active_threads.fetch_sub(1, Ordering::AcqRel) == 1
    }
}
