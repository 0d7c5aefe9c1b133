//! Bounded single-producer single-consumer ring
//!
//! The ring is split into a [`RingProducer`] and a [`RingConsumer`]. Neither handle is `Clone`,
//! so the one-producer one-consumer discipline is enforced by ownership: whoever holds the
//! producer is the only thread that can enqueue.
//!
//! Bulk enqueues are all-or-nothing. A burst either fits entirely or is rejected and left with the
//! caller, who decides what to do with it (the relay frees it).

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("ring `{name}` has capacity {capacity}, but capacity must be a non-zero power of two")]
    InvalidCapacity { name: Arc<str>, capacity: usize },
}

/// Returned when a bulk enqueue is rejected; the burst stays with the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull {
    pub requested: usize,
    pub free: usize,
}

/// Hands out unique ring names
///
/// Passed explicitly to whoever creates rings, so names are unique per namer without any
/// process-wide counter.
#[derive(Default)]
pub struct RingNamer {
    next: u64,
}

impl RingNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_name(&mut self, kind: &str, context_id: u16) -> Arc<str> {
        let n = self.next;
        self.next += 1;
        format!("{kind}_{context_id}_{n}").into_boxed_str().into()
    }
}

struct RingShared<T> {
    name: Arc<str>,
    /// Next slot the producer writes, published with `Release`
    head: CachePadded<AtomicUsize>,
    /// Next slot the consumer reads, published with `Release`
    tail: CachePadded<AtomicUsize>,
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: slots in `tail..head` are only touched by the consumer and slots outside of it only by
// the producer; the head/tail handoff uses acquire/release ordering
unsafe impl<T: Send> Send for RingShared<T> {}
unsafe impl<T: Send> Sync for RingShared<T> {}

impl<T> RingShared<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> *mut MaybeUninit<T> {
        self.slots[index & self.mask].get()
    }
}

impl<T> Drop for RingShared<T> {
    fn drop(&mut self) {
        // Both handles are gone, so whatever is still queued is ours to drop
        let head = self.head.load(Ordering::Acquire);
        let mut tail = self.tail.load(Ordering::Acquire);
        while tail != head {
            // SAFETY: slots in `tail..head` were initialized by the producer and not yet read
            unsafe { (*self.slot(tail)).assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

pub struct RingProducer<T> {
    ring: Arc<RingShared<T>>,
    head: usize,
    cached_tail: usize,
}

pub struct RingConsumer<T> {
    ring: Arc<RingShared<T>>,
    tail: usize,
    cached_head: usize,
}

/// Creates a ring with room for `capacity` items
pub fn ring<T: Send>(
    name: Arc<str>,
    capacity: usize,
) -> Result<(RingProducer<T>, RingConsumer<T>), RingError> {
    if !capacity.is_power_of_two() {
        return Err(RingError::InvalidCapacity { name, capacity });
    }

    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let ring = Arc::new(RingShared {
        name,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        mask: capacity - 1,
        slots,
    });

    Ok((
        RingProducer {
            ring: ring.clone(),
            head: 0,
            cached_tail: 0,
        },
        RingConsumer {
            ring,
            tail: 0,
            cached_head: 0,
        },
    ))
}

impl<T> RingProducer<T> {
    pub fn name(&self) -> &Arc<str> {
        &self.ring.name
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    fn cached_free(&self) -> usize {
        self.ring.capacity() - self.head.wrapping_sub(self.cached_tail)
    }

    /// Free slots, refreshing the consumer position only when the cached view is too small
    fn free_for(&mut self, wanted: usize) -> usize {
        let free = self.cached_free();
        if free >= wanted {
            return free;
        }

        self.cached_tail = self.ring.tail.load(Ordering::Acquire);
        self.cached_free()
    }

    /// Enqueues a single item, handing it back if the ring is full
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        if self.free_for(1) == 0 {
            return Err(item);
        }

        // SAFETY: the slot is outside `tail..head`, so the consumer does not touch it
        unsafe { (*self.ring.slot(self.head)).write(item) };
        self.head = self.head.wrapping_add(1);
        self.ring.head.store(self.head, Ordering::Release);
        Ok(())
    }

    /// Moves every item of `burst` into the ring, or none of them
    ///
    /// On success `burst` is left empty. On failure it is left untouched.
    pub fn enqueue_bulk(&mut self, burst: &mut Vec<T>) -> Result<(), RingFull> {
        let requested = burst.len();
        if requested == 0 {
            return Ok(());
        }

        let free = self.free_for(requested);
        if free < requested {
            return Err(RingFull { requested, free });
        }

        for (i, item) in burst.drain(..).enumerate() {
            // SAFETY: we checked that `requested` slots past `head` are free
            unsafe { (*self.ring.slot(self.head.wrapping_add(i))).write(item) };
        }

        // A single release store publishes the whole burst
        self.head = self.head.wrapping_add(requested);
        self.ring.head.store(self.head, Ordering::Release);
        Ok(())
    }
}

impl<T> RingConsumer<T> {
    pub fn name(&self) -> &Arc<str> {
        &self.ring.name
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of items currently queued (exact from the consumer's point of view)
    pub fn len(&self) -> usize {
        self.ring.head.load(Ordering::Acquire).wrapping_sub(self.tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends up to `max` items to `out`, in the order they were enqueued
    pub fn dequeue_burst(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let mut available = self.cached_head.wrapping_sub(self.tail);
        if available == 0 {
            self.cached_head = self.ring.head.load(Ordering::Acquire);
            available = self.cached_head.wrapping_sub(self.tail);
        }

        let n = available.min(max);
        if n == 0 {
            return 0;
        }

        out.reserve(n);
        for i in 0..n {
            // SAFETY: slots in `tail..cached_head` were published by the producer
            let item = unsafe { (*self.ring.slot(self.tail.wrapping_add(i))).assume_init_read() };
            out.push(item);
        }

        self.tail = self.tail.wrapping_add(n);
        self.ring.tail.store(self.tail, Ordering::Release);
        n
    }
}
