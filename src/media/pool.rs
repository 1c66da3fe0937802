//! Pool of reusable, equally sized byte buffers for decompressed alpha planes.
//!
//! The first few buffers are allocated up front and the rest lazily on first use.
//! A [`PooledBuffer`] returns itself to its slot when dropped, so a buffer handed to
//! the renderer goes back to the pool as soon as the renderer lets go of it.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

/// Buffers allocated when the pool is created.
pub const PREALLOCATED_BUFFERS: usize = 5;

struct PoolState {
    buffers: Vec<Option<Vec<u8>>>,
    used: Vec<bool>,
}

/// Fixed-size pool of byte buffers.
#[derive(Clone)]
pub struct NativeBufferPool {
    buffer_size: usize,
    state: Arc<Mutex<PoolState>>,
}

impl NativeBufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self::with_preallocated(capacity, buffer_size, PREALLOCATED_BUFFERS)
    }

    pub fn with_preallocated(capacity: usize, buffer_size: usize, preallocated: usize) -> Self {
        let buffers = (0..capacity)
            .map(|i| if i < preallocated { Some(vec![0u8; buffer_size]) } else { None })
            .collect();
        Self {
            buffer_size,
            state: Arc::new(Mutex::new(PoolState { buffers, used: vec![false; capacity] })),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().used.len()
    }

    /// Buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.state.lock().used.iter().filter(|used| **used).count()
    }

    /// Buffers allocated so far, whether in use or idle.
    pub fn allocated(&self) -> usize {
        let state = self.state.lock();
        let idle = state.buffers.iter().filter(|b| b.is_some()).count();
        let lent = state.used.iter().filter(|used| **used).count();
        idle + lent
    }

    /// Takes the first free buffer, allocating it if needed. `None` when exhausted.
    pub fn acquire(&self) -> Option<PooledBuffer> {
        let mut state = self.state.lock();
        let index = state.used.iter().position(|used| !used)?;
        state.used[index] = true;
        let data = match state.buffers[index].take() {
            Some(data) => data,
            None => {
                trace!(index, size = self.buffer_size, "Allocating pooled buffer");
                vec![0u8; self.buffer_size]
            }
        };
        Some(PooledBuffer { data, index: Some(index), home: Arc::downgrade(&self.state) })
    }

    /// Like [`acquire`](Self::acquire), falling back to a one-off allocation that is
    /// freed instead of returned when the pool is exhausted.
    pub fn acquire_or_allocate(&self) -> PooledBuffer {
        self.acquire().unwrap_or_else(|| {
            debug!(size = self.buffer_size, "Buffer pool exhausted, allocating unpooled buffer");
            PooledBuffer { data: vec![0u8; self.buffer_size], index: None, home: Weak::new() }
        })
    }

    /// Returns a buffer early. Equivalent to dropping it.
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }
}

impl std::fmt::Debug for NativeBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// A buffer borrowed from a [`NativeBufferPool`], returned on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    index: Option<usize>,
    home: Weak<Mutex<PoolState>>,
}

impl PooledBuffer {
    /// Pool slot this buffer belongs to, `None` for overflow allocations.
    pub fn index(&self) -> Option<usize> {
        self.index
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer").field("index", &self.index).field("len", &self.data.len()).finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(index) = self.index else { return };
        if let Some(state) = self.home.upgrade() {
            let mut state = state.lock();
            state.buffers[index] = Some(std::mem::take(&mut self.data));
            state.used[index] = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preallocates_only_the_first_buffers() {
        let pool = NativeBufferPool::new(15, 16);
        assert_eq!(pool.capacity(), 15);
        assert_eq!(pool.allocated(), PREALLOCATED_BUFFERS);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let pool = NativeBufferPool::with_preallocated(2, 4, 0);
        let a = pool.acquire().expect("first");
        let b = pool.acquire().expect("second");
        assert_eq!(pool.in_use(), 2);
        assert!(pool.acquire().is_none());
        pool.release(a);
        let c = pool.acquire().expect("released slot is reused");
        assert_eq!(c.index(), Some(0));
        drop(b);
        drop(c);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn released_buffer_is_the_same_allocation() {
        let pool = NativeBufferPool::new(3, 32);
        let mut first = pool.acquire().expect("buffer");
        first[0] = 0xAB;
        let ptr = first.as_ptr();
        drop(first);
        let again = pool.acquire().expect("buffer");
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(again[0], 0xAB);
        assert_eq!(again.len(), 32);
    }

    #[test]
    fn overflow_allocation_is_not_pooled() {
        let pool = NativeBufferPool::with_preallocated(1, 4, 1);
        let held = pool.acquire_or_allocate();
        let extra = pool.acquire_or_allocate();
        assert_eq!(held.index(), Some(0));
        assert_eq!(extra.index(), None);
        assert_eq!(extra.len(), 4);
        drop(extra);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn buffers_outliving_the_pool_are_freed() {
        let pool = NativeBufferPool::new(1, 8);
        let buffer = pool.acquire().expect("buffer");
        drop(pool);
        drop(buffer);
    }
}
