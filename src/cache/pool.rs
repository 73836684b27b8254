use crossbeam_queue::ArrayQueue;

use crate::incoming::Sample;

/// Reusable carrier for one sample on its way to the ingestion worker.
#[derive(Debug, Default)]
pub struct InsertionBuffer {
    pub sample: Option<Sample>,
}

/// Bounded free-list of insertion buffers.
///
/// Both operations are non-blocking. An empty list allocates and a full
/// list drops the returned buffer.
#[derive(Debug)]
pub struct BufferPool {
    free: ArrayQueue<Box<InsertionBuffer>>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity),
        }
    }

    /// Take a buffer from the free-list or allocate a new one.
    pub fn acquire(&self) -> Box<InsertionBuffer> {
        self.free.pop().unwrap_or_default()
    }

    /// Return a consumed buffer; discarded when the list is full.
    pub fn release(&self, mut buf: Box<InsertionBuffer>) {
        buf.sample = None;
        let _ = self.free.push(buf);
    }

    /// Buffers currently available for reuse.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }
}
