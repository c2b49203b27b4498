//! Leaky buffer pool
//!
//! Fixed-capacity pool of fixed-size buffers for the UDP receive paths. When
//! the pool is empty `get` allocates fresh; when it is full `put` drops the
//! returned buffer on the floor. Buffers are not zeroed on reuse, so callers
//! track effective length themselves.

use bytes::BytesMut;
use parking_lot::Mutex;

/// Default element size for the UDP payload pool (max datagram).
pub const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// Default capacity of the UDP payload pool.
pub const UDP_BUFFER_POOL_SIZE: usize = 2048;

/// Default element size for the ancillary-data pool.
pub const UDP_OOB_BUFFER_SIZE: usize = 1024;

/// Default capacity of the ancillary-data pool.
pub const UDP_OOB_POOL_SIZE: usize = 2048;

/// A non-blocking pool of `buf_size`-byte buffers.
pub struct LeakyPool {
    buffers: Mutex<Vec<BytesMut>>,
    capacity: usize,
    buf_size: usize,
}

impl LeakyPool {
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            buf_size,
        }
    }

    /// Element size of this pool's buffers.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Take a buffer, allocating if the pool is empty. Never blocks.
    pub fn get(&self) -> BytesMut {
        if let Some(buf) = self.buffers.lock().pop() {
            return buf;
        }
        let mut buf = BytesMut::with_capacity(self.buf_size);
        buf.resize(self.buf_size, 0);
        buf
    }

    /// Return a buffer; discarded if the pool is already full. Never blocks.
    pub fn put(&self, mut buf: BytesMut) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buf.resize(self.buf_size, 0);
            buffers.push(buf);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.buffers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_allocates_when_empty() {
        let pool = LeakyPool::new(4, 128);
        let buf = pool.get();
        assert_eq!(buf.len(), 128);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_put_then_get_reuses() {
        let pool = LeakyPool::new(4, 128);
        let buf = pool.get();
        pool.put(buf);
        assert_eq!(pool.len(), 1);
        let _ = pool.get();
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_full_pool_discards() {
        let pool = LeakyPool::new(2, 16);
        pool.put(pool.get());
        pool.put(pool.get());
        assert_eq!(pool.len(), 2);
        let extra = {
            let mut b = BytesMut::with_capacity(16);
            b.resize(16, 0);
            b
        };
        pool.put(extra);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_returned_buffer_is_full_size() {
        let pool = LeakyPool::new(2, 64);
        let mut buf = pool.get();
        buf.truncate(3);
        pool.put(buf);
        assert_eq!(pool.get().len(), 64);
    }
}
