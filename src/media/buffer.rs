//! Fixed-capacity circular queue of pre-sized frame slots.
//!
//! Slots are allocated once. Producers and consumers exchange whole slot vectors
//! with [`std::mem::swap`], so frames are neither copied nor reallocated on the hot
//! path and the lock is never held across socket I/O: the producer reads into its own
//! spare vector and swaps it in, the consumer swaps a spare vector in to take a frame.
//!
//! One slot is always left unused: the queue holds at most `capacity - 1` frames.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

/// Upper bound on a single condition-variable wait. Waiters re-check their stop
/// predicate at least this often even if a wake-up is lost.
const WAIT_SLICE: Duration = Duration::from_millis(100);

struct Ring {
    slots: Vec<Vec<u8>>,
    lengths: Vec<usize>,
    head: usize,
    tail: usize,
}

impl Ring {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % self.capacity() == self.head
    }

    fn len(&self) -> usize {
        (self.tail + self.capacity() - self.head) % self.capacity()
    }
}

/// Lock-protected media frame queue shared by one producer and one consumer.
pub struct MediaBuffer {
    name: &'static str,
    slot_size: usize,
    ring: Mutex<Ring>,
    ready: Condvar,
    space: Condvar,
}

impl MediaBuffer {
    /// Creates a buffer with `capacity` slots of `slot_size` bytes each.
    ///
    /// Capacities below two are raised to two, the smallest ring that can hold a frame.
    pub fn new(name: &'static str, capacity: usize, slot_size: usize) -> Self {
        let capacity = capacity.max(2);
        let ring = Ring {
            slots: (0..capacity).map(|_| vec![0u8; slot_size]).collect(),
            lengths: vec![0; capacity],
            head: 0,
            tail: 0,
        };
        Self { name, slot_size, ring: Mutex::new(ring), ready: Condvar::new(), space: Condvar::new() }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// A vector suitable for exchanging with a slot.
    pub fn spare(&self) -> Vec<u8> {
        vec![0u8; self.slot_size]
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.lock().is_full()
    }

    /// Moves the first `len` bytes of `frame` into the next slot by swapping vectors.
    ///
    /// On success `frame` holds the slot's previous vector, ready for the next read.
    /// Returns `false` without touching `frame` when the buffer is full.
    #[must_use]
    pub fn enqueue_swap(&self, frame: &mut Vec<u8>, len: usize) -> bool {
        if len > self.slot_size {
            warn!(buffer = self.name, len, slot_size = self.slot_size, "Frame larger than slot, dropped");
            return false;
        }
        let mut ring = self.ring.lock();
        if ring.is_full() {
            return false;
        }
        if frame.len() < self.slot_size {
            frame.resize(self.slot_size, 0);
        }
        let index = ring.tail;
        std::mem::swap(&mut ring.slots[index], frame);
        ring.lengths[index] = len;
        ring.tail = (index + 1) % ring.capacity();
        trace!(buffer = self.name, len, size = ring.len(), "enqueued");
        drop(ring);
        self.ready.notify_one();
        true
    }

    /// Copies `data` into the next slot. Returns `false` when full or oversized.
    #[must_use]
    pub fn enqueue_copy(&self, data: &[u8]) -> bool {
        if data.len() > self.slot_size {
            warn!(buffer = self.name, len = data.len(), slot_size = self.slot_size, "Frame larger than slot, dropped");
            return false;
        }
        let mut ring = self.ring.lock();
        if ring.is_full() {
            return false;
        }
        let index = ring.tail;
        ring.slots[index][..data.len()].copy_from_slice(data);
        ring.lengths[index] = data.len();
        ring.tail = (index + 1) % ring.capacity();
        drop(ring);
        self.ready.notify_one();
        true
    }

    /// Takes the oldest frame by swapping `out` into its slot.
    ///
    /// Returns the frame length, the frame bytes being `out[..len]`.
    pub fn try_dequeue(&self, out: &mut Vec<u8>) -> Option<usize> {
        let mut ring = self.ring.lock();
        let len = self.pop(&mut ring, out)?;
        drop(ring);
        self.space.notify_one();
        Some(len)
    }

    /// Blocks until a frame is available or `should_stop` returns true.
    pub fn dequeue_blocking(&self, out: &mut Vec<u8>, should_stop: impl Fn() -> bool) -> Option<usize> {
        let mut ring = self.ring.lock();
        loop {
            if should_stop() {
                return None;
            }
            if let Some(len) = self.pop(&mut ring, out) {
                drop(ring);
                self.space.notify_one();
                return Some(len);
            }
            self.ready.wait_for(&mut ring, WAIT_SLICE);
        }
    }

    /// Waits up to `timeout` for a free slot. Returns whether one is free.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        let mut ring = self.ring.lock();
        if !ring.is_full() {
            return true;
        }
        self.space.wait_for(&mut ring, timeout);
        !ring.is_full()
    }

    /// Runs `f` over the most recently enqueued frame, if any.
    pub fn peek_last<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let ring = self.ring.lock();
        if ring.is_empty() {
            return None;
        }
        let index = (ring.tail + ring.capacity() - 1) % ring.capacity();
        Some(f(&ring.slots[index][..ring.lengths[index]]))
    }

    /// Discards every queued frame.
    pub fn reset(&self) {
        let mut ring = self.ring.lock();
        ring.head = 0;
        ring.tail = 0;
        drop(ring);
        trace!(buffer = self.name, "reset");
        self.space.notify_all();
    }

    /// Wakes every blocked producer and consumer so they re-check their stop predicates.
    pub fn wake_all(&self) {
        let _ring = self.ring.lock();
        self.ready.notify_all();
        self.space.notify_all();
    }

    fn pop(&self, ring: &mut Ring, out: &mut Vec<u8>) -> Option<usize> {
        if ring.is_empty() {
            return None;
        }
        if out.len() < self.slot_size {
            out.resize(self.slot_size, 0);
        }
        let index = ring.head;
        std::mem::swap(&mut ring.slots[index], out);
        ring.head = (index + 1) % ring.capacity();
        Some(ring.lengths[index])
    }
}

impl std::fmt::Debug for MediaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("MediaBuffer")
            .field("name", &self.name)
            .field("capacity", &ring.capacity())
            .field("slot_size", &self.slot_size)
            .field("len", &ring.len())
            .finish()
    }
}
