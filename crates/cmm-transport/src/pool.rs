//! Bounded pool of reusable frame buffers.
//!
//! Every encode and decode borrows one buffer sized for a full frame
//! (header + MTU). Checkout waits when the pool is empty; the buffer goes
//! back to the free list when the [`PooledBuffer`] guard drops, on error
//! paths included. The ceiling bounds in-flight frame memory.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::header::{FRAME_MTU, HEADER_SIZE};
use crate::TransportError;

/// Default number of buffers in a pool.
pub const BUFFER_POOL_SIZE: usize = 16;

/// A fixed set of frame buffers shared by all codecs of one runtime.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    permits: Arc<Semaphore>,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    /// Create a pool of `capacity` buffers, each able to hold one full frame.
    pub fn new(capacity: usize) -> Arc<Self> {
        Self::with_buffer_size(capacity, HEADER_SIZE + FRAME_MTU)
    }

    pub fn with_buffer_size(capacity: usize, buffer_size: usize) -> Arc<Self> {
        let free = (0..capacity)
            .map(|_| BytesMut::with_capacity(buffer_size))
            .collect();
        Arc::new(Self {
            free: Mutex::new(free),
            permits: Arc::new(Semaphore::new(capacity)),
            buffer_size,
            capacity,
        })
    }

    /// Check out a buffer, waiting until one is returned if the pool is empty.
    pub async fn checkout(self: &Arc<Self>) -> Result<PooledBuffer, TransportError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Shutdown)?;
        Ok(self.take(permit))
    }

    /// Check out a buffer without waiting.
    pub fn try_checkout(self: &Arc<Self>) -> Option<PooledBuffer> {
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        Some(self.take(permit))
    }

    /// Buffers currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wake every waiter with [`TransportError::Shutdown`].
    pub fn close(&self) {
        self.permits.close();
    }

    fn take(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> PooledBuffer {
        // A permit guarantees a free buffer; the fallback only covers a poisoned lock.
        let buf = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
            _permit: permit,
        }
    }

    fn give_back(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() < self.buffer_size {
            buf.reserve(self.buffer_size);
        }
        if let Ok(mut free) = self.free.lock() {
            free.push(buf);
        }
    }
}

/// A checked-out buffer. Returned to its pool exactly once, on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
    // Released after `drop` below has pushed the buffer back.
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.give_back(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    #[tokio::test]
    async fn checkout_and_return() {
        let pool = BufferPool::new(2);
        assert_eq!(pool.available(), 2);

        let a = pool.checkout().await.unwrap();
        assert_eq!(pool.available(), 1);
        assert!(a.capacity() >= HEADER_SIZE + FRAME_MTU);

        drop(a);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn buffers_come_back_cleared() {
        let pool = BufferPool::new(1);
        {
            let mut buf = pool.checkout().await.unwrap();
            buf.extend_from_slice(b"leftover");
        }
        let buf = pool.checkout().await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn no_buffer_is_handed_out_twice() {
        let pool = BufferPool::new(BUFFER_POOL_SIZE);
        let mut held = Vec::new();
        for _ in 0..BUFFER_POOL_SIZE {
            held.push(pool.checkout().await.unwrap());
        }
        let distinct: HashSet<*const u8> = held.iter().map(|b| b.as_ptr()).collect();
        assert_eq!(distinct.len(), BUFFER_POOL_SIZE);
        assert!(pool.try_checkout().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn checkout_blocks_until_checkin() {
        let pool = BufferPool::new(BUFFER_POOL_SIZE);
        let mut held = Vec::new();
        for _ in 0..BUFFER_POOL_SIZE {
            held.push(pool.checkout().await.unwrap());
        }

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.checkout().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!waiter.is_finished(), "checkout must wait while the pool is empty");

        held.pop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke after checkin")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let pool = BufferPool::new(1);
        let _held = pool.checkout().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.checkout().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(TransportError::Shutdown)));
    }
}
