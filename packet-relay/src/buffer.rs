//! Packet buffers and the pool they are carved from
//!
//! A [`PacketBuffer`] owns one frame. Moving it between stages moves ownership, so a buffer can
//! only ever be held by one stage. Dropping it is the one and only way to free it: pooled storage
//! goes back to its [`BufferPool`] and the pool counts the release.

use crossbeam_queue::ArrayQueue;
use std::fmt::{Debug, Formatter};
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_HEADROOM: usize = 128;
pub const DEFAULT_DATA_ROOM: usize = 2048;

#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    free: ArrayQueue<Box<[u8]>>,
    capacity: usize,
    headroom: usize,
    allocated: AtomicU64,
    freed: AtomicU64,
    exhausted: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub allocated: u64,
    pub freed: u64,
    pub exhausted: u64,
}

impl PoolStats {
    /// Buffers currently owned by some stage (or queued in a ring)
    pub fn in_use(&self) -> u64 {
        self.allocated - self.freed
    }
}

impl BufferPool {
    /// Creates a pool holding `capacity` buffers of `headroom + data_room` bytes each
    pub fn new(capacity: usize, headroom: usize, data_room: usize) -> Self {
        let free = ArrayQueue::new(capacity.max(1));
        for _ in 0..capacity {
            // Cannot fail, the queue was sized for exactly this many buffers
            free.push(vec![0; headroom + data_room].into_boxed_slice()).ok();
        }

        Self {
            shared: Arc::new(PoolShared {
                free,
                capacity,
                headroom,
                allocated: AtomicU64::new(0),
                freed: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, DEFAULT_HEADROOM, DEFAULT_DATA_ROOM)
    }

    /// Takes an empty buffer out of the pool, or `None` when every buffer is in use
    pub fn alloc(&self) -> Option<PacketBuffer> {
        let Some(storage) = self.shared.free.pop() else {
            self.shared.exhausted.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        self.shared.allocated.fetch_add(1, Ordering::Relaxed);
        Some(PacketBuffer {
            storage,
            headroom: self.shared.headroom,
            len: 0,
            pool: Some(self.shared.clone()),
        })
    }

    /// Takes a buffer out of the pool and fills it with `frame`
    ///
    /// Returns `None` if the pool is exhausted or the frame does not fit in a single buffer (in
    /// the latter case the buffer goes straight back to the pool)
    pub fn alloc_frame(&self, frame: &[u8]) -> Option<PacketBuffer> {
        let mut buffer = self.alloc()?;
        buffer.append(frame).then_some(buffer)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.shared.capacity,
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            freed: self.shared.freed.load(Ordering::Relaxed),
            exhausted: self.shared.exhausted.load(Ordering::Relaxed),
        }
    }
}

pub struct PacketBuffer {
    storage: Box<[u8]>,
    headroom: usize,
    len: usize,
    pool: Option<Arc<PoolShared>>,
}

impl PacketBuffer {
    /// Creates a buffer that does not belong to any pool
    pub fn from_frame(frame: &[u8]) -> Self {
        let mut storage = vec![0; DEFAULT_HEADROOM + frame.len()].into_boxed_slice();
        storage[DEFAULT_HEADROOM..].copy_from_slice(frame);
        Self {
            storage,
            headroom: DEFAULT_HEADROOM,
            len: frame.len(),
            pool: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.storage[self.headroom..self.headroom + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tailroom(&self) -> usize {
        self.storage.len() - self.headroom - self.len
    }

    /// Appends `bytes` after the current frame contents, returning false if they do not fit
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.tailroom() {
            return false;
        }

        let start = self.headroom + self.len;
        self.storage[start..start + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };

        let storage = mem::take(&mut self.storage);
        pool.freed.fetch_add(1, Ordering::Relaxed);

        // The pool never holds more buffers than it handed out, so this only fails if someone
        // mixed buffers across pools
        pool.free.push(storage).ok();
    }
}

impl Debug for PacketBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len)
            .field("headroom", &self.headroom)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_alloc_and_free_return_storage() {
        let pool = BufferPool::new(2, 16, 64);
        let a = pool.alloc_frame(&[1, 2, 3]).unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.stats().in_use(), 2);
        assert_eq!(pool.stats().exhausted, 1);

        assert_eq!(a.data(), &[1, 2, 3]);
        assert!(b.is_empty());

        drop(a);
        assert_eq!(pool.stats().in_use(), 1);
        let c = pool.alloc().unwrap();
        assert!(c.is_empty(), "recycled buffers start out empty");

        drop(b);
        drop(c);
        let stats = pool.stats();
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.freed, 3);
        assert_eq!(stats.in_use(), 0);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let pool = BufferPool::new(1, 0, 4);
        assert!(pool.alloc_frame(&[0; 5]).is_none());

        // The rejected buffer went back to the pool
        assert_eq!(pool.stats().in_use(), 0);
        assert!(pool.alloc_frame(&[0; 4]).is_some());
    }
}
