//! Reusable column buffers.
//!
//! Column buffers are sized for a full WIP block, so allocating them per
//! column per segment is wasteful. Buffers released by a dropped column go
//! back here and are handed out again, cleared, to the next column.

use parking_lot::Mutex;

/// Bounded free list of byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buf_capacity: usize,
    max_pooled: usize,
}

impl BufferPool {
    /// ## Arguments
    ///
    /// - `buf_capacity`: capacity of freshly allocated buffers
    /// - `max_pooled`: buffers beyond this count are dropped on release
    pub fn new(buf_capacity: usize, max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buf_capacity,
            max_pooled,
        }
    }

    /// Take an empty buffer, reusing a released one when available.
    pub fn get(&self) -> Vec<u8> {
        match self.free.lock().pop() {
            Some(buf) => buf,
            None => Vec::with_capacity(self.buf_capacity),
        }
    }

    /// Return a buffer for reuse.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}
