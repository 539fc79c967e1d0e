use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::sync::TreiberStack;

/// `BufferPool` object that hands out fixed size block buffers.
///
/// Freed buffers are kept on a lock free stack for reuse instead of being
/// returned to the allocator. The pool enforces a bound on the number of
/// buffers checked out at any one time; callers that are refused fall back
/// to transient buffers outside the pooled accounting.
pub struct BufferPool {
    free: TreiberStack<Vec<u8>>,
    block_size: usize,
    capacity: usize,
    in_use: AtomicUsize,
}

impl BufferPool {
    /// Create a new `BufferPool` with the given buffer capacity and buffer size.
    pub fn new(capacity: usize, block_size: usize) -> BufferPool {
        BufferPool {
            free: TreiberStack::new(),
            block_size,
            capacity,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Check out a buffer, or None if the pool is at capacity.
    pub fn alloc(&self) -> Option<Vec<u8>> {
        let mut current = self.in_use.load(Ordering::Acquire);

        loop {
            if current == self.capacity {
                return None;
            }

            match self.in_use.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Some(self.free.try_pop().unwrap_or_else(|| vec![0u8; self.block_size]))
    }

    /// Allocate a transient buffer outside the pooled accounting.
    ///
    /// Used by the uncached direct I/O path which holds exactly one buffer
    /// for the duration of a single job.
    pub fn alloc_direct(&self) -> Vec<u8> {
        vec![0u8; self.block_size]
    }

    /// Check a buffer back in.
    pub fn free(&self, buffer: Vec<u8>) {
        debug_assert_eq!(self.block_size, buffer.len());

        self.free.push(buffer);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of buffers currently checked out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Size of each buffer handed out.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bound on the number of buffers checked out at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
