//! Leaky buffer pool
//!
//! A bounded free-list of fixed-size buffers for the UDP hot path. Getting
//! a buffer pops from the free list or allocates; dropping the guard pushes
//! it back, or lets it deallocate when the pool is already full. Buffers
//! are never zeroed between uses, callers must only trust the prefix they
//! have written or received into.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// One maximum UDP datagram on the wire
pub const UDP_BUFFER_SIZE: usize = 4096;

const DEFAULT_POOL_CAPACITY: usize = 2048;

pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, buf_size: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool {
            free: Mutex::new(Vec::with_capacity(capacity)),
            buf_size,
            capacity,
        })
    }

    /// Pool sized for UDP relaying
    pub fn for_udp() -> Arc<BufferPool> {
        BufferPool::new(DEFAULT_POOL_CAPACITY, UDP_BUFFER_SIZE)
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Take a buffer out of the pool, allocating if the pool is empty.
    /// The buffer comes back on drop of the guard.
    pub fn get(self: &Arc<BufferPool>) -> PooledBuf {
        let buf = {
            let mut free = self.free.lock().expect("buffer pool poisoned");
            free.pop()
        };
        let buf = buf.unwrap_or_else(|| vec![0u8; self.buf_size]);
        PooledBuf {
            buf,
            pool: self.clone(),
        }
    }

    fn put(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().expect("buffer pool poisoned");
        if free.len() < self.capacity {
            free.push(buf);
        }
        // otherwise the buffer just deallocates
    }
}

/// A buffer borrowed from a pool, returned on drop
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.put(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new(4, 32);

        let mut a = pool.get();
        a[0] = 0xA5;
        let ptr = a.as_ptr();
        drop(a);

        let b = pool.get();
        assert_eq!(b.as_ptr(), ptr);
        // contents survive, prefix discipline is on the caller
        assert_eq!(b[0], 0xA5);
    }

    #[test]
    fn pool_overflow_drops_buffers() {
        let pool = BufferPool::new(1, 8);
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.free.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_pool_allocates() {
        let pool = BufferPool::new(2, 16);
        let a = pool.get();
        let b = pool.get();
        let c = pool.get();
        assert_eq!(a.len(), 16);
        assert_eq!(b.len(), 16);
        assert_eq!(c.len(), 16);
    }
}
