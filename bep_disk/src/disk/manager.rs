use std::sync::Arc;
use std::thread;

use crate::cache::BlockCache;
use crate::disk::builder::DiskManagerBuilder;
use crate::disk::fs::FileSystem;
use crate::disk::pool::JobQueues;
use crate::disk::tasks;
use crate::disk::tasks::context::DiskManagerContext;
use crate::disk::{IDiskMessage, ODiskMessage};
use crate::memory::buffer_pool::BufferPool;
use crate::stats::{DiskStats, DiskStatsSnapshot};
use crate::BLOCK_SIZE;

use futures::sync::mpsc::{self, Receiver};
use futures::task;
use futures::{Async, AsyncSink, Poll, Sink, StartSend, Stream};

/// `DiskManager` object which handles the storage of blocks to the `FileSystem`.
pub struct DiskManager<F> {
    sink: DiskManagerSink<F>,
    stream: DiskManagerStream,
}

impl<F> DiskManager<F>
where
    F: FileSystem + Send + Sync + 'static,
{
    /// Create a DiskManager from the given builder, spawning its workers.
    pub fn from_builder(builder: DiskManagerBuilder, fs: F) -> DiskManager<F> {
        let settings = builder.settings();
        let (out_send, out_recv) = mpsc::channel(builder.stream_buffer_capacity());

        let pool = Arc::new(BufferPool::new(settings.cache_size, BLOCK_SIZE));
        let stats = Arc::new(DiskStats::new());
        let cache = BlockCache::new(settings, pool.clone(), stats.clone());

        let context = DiskManagerContext::new(out_send, fs, cache, pool, stats, settings);
        let queues = Arc::new(JobQueues::new(settings.worker_threads, settings.max_queued_jobs));

        for thread_id in 0..settings.worker_threads {
            let thread_context = context.clone();
            let thread_queues = queues.clone();

            thread::spawn(move || {
                tasks::run_worker(thread_id, thread_context, thread_queues);
            });
        }

        DiskManager {
            sink: DiskManagerSink::new(context, queues),
            stream: DiskManagerStream::new(out_recv),
        }
    }

    /// Point in time snapshot of the disk and cache counters.
    pub fn stats(&self) -> DiskStatsSnapshot {
        self.sink.context.stats().snapshot()
    }
}

impl<F> Sink for DiskManager<F>
where
    F: FileSystem + Send + Sync + 'static,
{
    type SinkItem = IDiskMessage;
    type SinkError = ();

    fn start_send(&mut self, item: IDiskMessage) -> StartSend<IDiskMessage, ()> {
        self.sink.start_send(item)
    }

    fn poll_complete(&mut self) -> Poll<(), ()> {
        self.sink.poll_complete()
    }
}

impl<F> Stream for DiskManager<F> {
    type Item = ODiskMessage;
    type Error = ();

    fn poll(&mut self) -> Poll<Option<ODiskMessage>, ()> {
        self.stream.poll()
    }
}

impl<F> Drop for DiskManager<F> {
    fn drop(&mut self) {
        self.sink.queues.shutdown();
    }
}

//----------------------------------------------------------------------------//

pub struct DiskManagerSink<F> {
    context: DiskManagerContext<F>,
    queues: Arc<JobQueues>,
}

impl<F> DiskManagerSink<F> {
    fn new(context: DiskManagerContext<F>, queues: Arc<JobQueues>) -> DiskManagerSink<F> {
        DiskManagerSink { context, queues }
    }
}

impl<F> Sink for DiskManagerSink<F>
where
    F: FileSystem + Send + Sync + 'static,
{
    type SinkItem = IDiskMessage;
    type SinkError = ();

    fn start_send(&mut self, item: IDiskMessage) -> StartSend<IDiskMessage, ()> {
        info!("Starting Send For DiskManagerSink With IDiskMessage");

        if !self.queues.can_submit() {
            self.queues.park_sender(task::current());

            // Check again so a drain between the check and the park is not
            // missed forever.
            if !self.queues.can_submit() {
                info!("DiskManagerSink Not Ready For New Work");

                return Ok(AsyncSink::NotReady(item));
            }
        }

        self.context.add_job(item.into(), &self.queues);

        info!("DiskManagerSink Submitted Work To The Job Queues");

        Ok(AsyncSink::Ready)
    }

    fn poll_complete(&mut self) -> Poll<(), ()> {
        Ok(Async::Ready(()))
    }
}

//----------------------------------------------------------------------------//

pub struct DiskManagerStream {
    recv: Receiver<ODiskMessage>,
}

impl DiskManagerStream {
    fn new(recv: Receiver<ODiskMessage>) -> DiskManagerStream {
        DiskManagerStream { recv }
    }
}

impl Stream for DiskManagerStream {
    type Item = ODiskMessage;
    type Error = ();

    fn poll(&mut self) -> Poll<Option<ODiskMessage>, ()> {
        info!("Polling DiskManagerStream For ODiskMessage");

        self.recv.poll()
    }
}
