//! Scratch buffer pool for checksum passes.
//!
//! Buffers are borrowed for the duration of one call and handed back
//! zeroed, so nothing read during one digest is visible to the next
//! borrower. When the pool is empty a fresh buffer is allocated; when it is
//! full a returned buffer is dropped.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Default scratch buffer size (32 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default number of pooled buffers.
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Lock-free pool of fixed-size byte buffers. Cheap to clone.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<ArrayQueue<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Creates a pool holding at most `pool_size` buffers of `buffer_size` bytes.
    ///
    /// Buffers are allocated on first use, not up front.
    pub fn new(buffer_size: usize, pool_size: usize) -> Self {
        Self {
            pool: Arc::new(ArrayQueue::new(pool_size.max(1))),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Takes a buffer of exactly `buffer_size` bytes.
    pub fn acquire(&self) -> Vec<u8> {
        self.pool
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    /// Returns a buffer to the pool. Buffers of the wrong size are dropped.
    pub fn release(&self, mut buffer: Vec<u8>) {
        if buffer.len() != self.buffer_size {
            return;
        }
        buffer.fill(0);
        let _ = self.pool.push(buffer);
    }

    /// Number of idle buffers currently held.
    pub fn available(&self) -> usize {
        self.pool.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_POOL_SIZE)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}
