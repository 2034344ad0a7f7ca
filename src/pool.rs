//! Process-wide pool of reusable request-body buffers.
//!
//! Bodies are accumulated into pooled buffers so that the hot write path
//! does not allocate per request. [`BufferPool::get`] hands out an RAII
//! guard; dropping the guard clears the buffer and returns it to the pool,
//! so every error path through the handler releases its buffer.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, OnceLock};

/// Buffers held in reserve; excess buffers are simply dropped.
const MAX_POOLED: usize = 64;

pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// The shared pool used by the relay request handlers.
    pub fn global() -> &'static BufferPool {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(BufferPool::new)
    }

    pub fn get(&self) -> PooledBuffer<'_> {
        let buf = self
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_default();
        PooledBuffer { pool: self, buf }
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock().expect("buffer pool lock poisoned");
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer checked out of a [`BufferPool`]; returned on drop.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returned_buffers_are_reused_and_cleared() {
        let pool = BufferPool::new();

        let capacity = {
            let mut buf = pool.get();
            buf.extend_from_slice(b"SELECT 1");
            buf.capacity()
        };

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), capacity);
    }

    #[test]
    fn release_happens_on_early_exit() {
        let pool = BufferPool::new();

        let attempt = || -> Result<(), ()> {
            let mut buf = pool.get();
            buf.extend_from_slice(b"partial body");
            Err(())
        };
        assert!(attempt().is_err());

        assert_eq!(pool.free.lock().unwrap().len(), 1);
    }
}
