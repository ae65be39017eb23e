//! Shared buffer pool
//!
//! Server deployments churn through connections; dictionary and scratch
//! buffers are recycled here instead of round-tripping the allocator. The
//! pool is the whole contract the engine consumes: `get` hands out a
//! cleared buffer with at least the configured capacity, `put` takes it
//! back.

use parking_lot::Mutex;

/// Pool of fixed-capacity byte buffers
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_cached: usize,
}

impl BufferPool {
    /// Create a pool handing out buffers with `buffer_size` capacity,
    /// caching at most `max_cached` returned buffers
    pub fn new(buffer_size: usize, max_cached: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_cached.min(16))),
            buffer_size,
            max_cached,
        }
    }

    /// Take a cleared buffer from the pool, allocating if it is empty
    pub fn get(&self) -> Vec<u8> {
        if let Some(mut buf) = self.free.lock().pop() {
            buf.clear();
            return buf;
        }
        Vec::with_capacity(self.buffer_size)
    }

    /// Return a buffer; undersized or surplus buffers are dropped
    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() < self.buffer_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_cached {
            free.push(buf);
        }
    }

    /// Number of buffers currently cached
    pub fn cached(&self) -> usize {
        self.free.lock().len()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_cached", &self.max_cached)
            .field("cached", &self.cached())
            .finish()
    }
}
