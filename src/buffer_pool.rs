//! Buffer pools backing receive staging and broadcast fan-out
//!
//! Two pools with different jobs:
//!
//! - [`BufferPool`]: a thread-safe pool of recycled `Vec<u8>` used for the
//!   reactor's receive completions. One buffer is drawn per in-flight
//!   receive and returned once the synchronize pass has consumed it, which
//!   bounds allocation churn under load.
//! - [`BroadcastPool`]: a bounded, single-threaded slot table that stores a
//!   broadcast payload exactly once per tick and hands out shared references
//!   for every recipient's send queue, so K recipients cost one storage
//!   operation instead of K copies.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::NetError;

/// A thread-safe pool of reusable byte buffers.
///
/// If the pool is empty, `acquire` falls back to allocation so it never
/// blocks; `release` drops excess buffers instead of growing without bound.
#[derive(Clone, Debug)]
pub struct BufferPool {
    buffers: Arc<Mutex<VecDeque<Vec<u8>>>>,
    default_capacity: usize,
    max_buffers: usize,
}

impl BufferPool {
    /// Creates a pool with `initial_count` pre-allocated buffers of
    /// `buffer_capacity` bytes each. The pool may retain up to twice the
    /// initial count.
    pub fn new(initial_count: usize, buffer_capacity: usize) -> Self {
        let mut buffers = VecDeque::with_capacity(initial_count * 2);
        for _ in 0..initial_count {
            buffers.push_back(Vec::with_capacity(buffer_capacity));
        }
        Self {
            buffers: Arc::new(Mutex::new(buffers)),
            default_capacity: buffer_capacity,
            max_buffers: initial_count * 2,
        }
    }

    /// Takes a buffer from the pool, allocating if none is available.
    ///
    /// Contents are not cleared; callers overwrite before use.
    pub fn acquire(&self) -> Vec<u8> {
        let mut buffers = self.buffers.lock().unwrap();
        buffers
            .pop_front()
            .unwrap_or_else(|| Vec::with_capacity(self.default_capacity))
    }

    /// Returns a buffer for reuse; capacity is preserved, contents cleared.
    pub fn release(&self, mut buffer: Vec<u8>) {
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_buffers {
            buffer.clear();
            buffers.push_back(buffer);
        }
    }

    /// Number of buffers currently idle in the pool.
    pub fn available_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    /// Default capacity of buffers created by this pool.
    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(16, 64 * 1024)
    }
}

/// Bounded per-tick storage for broadcast payloads.
///
/// `store` writes the payload into the next free slot and returns a shared
/// handle; the caller clones that handle into each recipient's send queue.
/// `reset` runs once per tick and makes all slots reusable. A slot whose
/// previous payload is still referenced by an unflushed send queue gets a
/// fresh allocation instead of clobbering bytes that are still in flight.
///
/// Overflowing the pool within one tick is a resource-exhaustion condition,
/// reported as an error; the pool never grows past its capacity.
#[derive(Debug)]
pub struct BroadcastPool {
    slots: Vec<Arc<Vec<u8>>>,
    used: usize,
    capacity: usize,
}

impl BroadcastPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            used: 0,
            capacity,
        }
    }

    /// Stores one payload, returning the shared reference for fan-out.
    pub fn store(&mut self, payload: &[u8]) -> Result<Arc<Vec<u8>>, NetError> {
        self.store_with(|buf| buf.extend_from_slice(payload))
    }

    /// Stores a payload framed with its length prefix, in a single copy.
    pub fn store_framed(&mut self, payload: &[u8]) -> Result<Arc<Vec<u8>>, NetError> {
        self.store_with(|buf| crate::frame::encode_frame_into(payload, buf))
    }

    fn store_with(&mut self, fill: impl FnOnce(&mut Vec<u8>)) -> Result<Arc<Vec<u8>>, NetError> {
        if self.used == self.capacity {
            return Err(NetError::Exhausted {
                what: "broadcast pool",
                capacity: self.capacity,
            });
        }
        if self.used == self.slots.len() {
            let mut buf = Vec::new();
            fill(&mut buf);
            self.slots.push(Arc::new(buf));
        } else {
            let slot = &mut self.slots[self.used];
            match Arc::get_mut(slot) {
                Some(buf) => {
                    // Sole owner: reuse the allocation.
                    buf.clear();
                    fill(buf);
                }
                None => {
                    // A previous tick's payload is still queued somewhere.
                    let mut buf = Vec::new();
                    fill(&mut buf);
                    *slot = Arc::new(buf);
                }
            }
        }
        self.used += 1;
        Ok(Arc::clone(&self.slots[self.used - 1]))
    }

    /// Makes all slots reusable. Called once per synchronize pass.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Slots consumed since the last reset.
    pub fn in_use(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_basic_operations() {
        let pool = BufferPool::new(4, 1024);
        assert_eq!(pool.available_count(), 4);

        let buffer = pool.acquire();
        assert_eq!(buffer.capacity(), 1024);
        assert_eq!(pool.available_count(), 3);

        pool.release(buffer);
        assert_eq!(pool.available_count(), 4);
    }

    #[test]
    fn test_buffer_pool_allocates_when_empty() {
        let pool = BufferPool::new(1, 256);
        let a = pool.acquire();
        let b = pool.acquire(); // pool empty, freshly allocated
        assert_eq!(b.capacity(), 256);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn test_buffer_pool_bounds_retention() {
        let pool = BufferPool::new(1, 64);
        // max_buffers is 2 * initial_count; a third release is dropped.
        pool.release(Vec::with_capacity(64));
        pool.release(Vec::with_capacity(64));
        pool.release(Vec::with_capacity(64));
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn test_broadcast_single_storage_many_references() {
        let mut pool = BroadcastPool::with_capacity(8);
        let shared = pool.store(b"payload").unwrap();
        assert_eq!(pool.in_use(), 1);

        // K queue insertions are Arc clones of the one stored payload.
        let queued: Vec<_> = (0..5).map(|_| Arc::clone(&shared)).collect();
        assert_eq!(Arc::strong_count(&shared), 7); // pool + local + 5 queues
        for q in &queued {
            assert_eq!(&***q, b"payload");
        }
    }

    #[test]
    fn test_broadcast_overflow_is_reported() {
        let mut pool = BroadcastPool::with_capacity(2);
        pool.store(b"a").unwrap();
        pool.store(b"b").unwrap();
        let err = pool.store(b"c").unwrap_err();
        assert!(matches!(
            err,
            NetError::Exhausted {
                what: "broadcast pool",
                capacity: 2,
            }
        ));
        assert_eq!(pool.in_use(), 2);

        pool.reset();
        assert!(pool.store(b"c").is_ok());
    }

    #[test]
    fn test_broadcast_reset_reuses_unreferenced_slots() {
        let mut pool = BroadcastPool::with_capacity(4);
        {
            let _ = pool.store(b"first").unwrap();
        }
        pool.reset();
        let again = pool.store(b"second").unwrap();
        assert_eq!(&**again, b"second");
        assert_eq!(pool.slots.len(), 1); // allocation was recycled, not grown
    }

    #[test]
    fn test_broadcast_inflight_payload_is_not_clobbered() {
        let mut pool = BroadcastPool::with_capacity(4);
        let held = pool.store(b"still queued").unwrap();
        pool.reset();
        // Slot 0 is reusable but its payload is still referenced; storing
        // again must not disturb the in-flight bytes.
        let fresh = pool.store(b"new payload").unwrap();
        assert_eq!(&**held, b"still queued");
        assert_eq!(&**fresh, b"new payload");
    }

    #[test]
    fn test_broadcast_framed_storage() {
        let mut pool = BroadcastPool::with_capacity(2);
        let framed = pool.store_framed(b"abc").unwrap();
        assert_eq!(&**framed, &[0, 0, 0, 3, b'a', b'b', b'c']);
    }
}
