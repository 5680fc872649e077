//! Lock-free single-producer / single-consumer ring buffer.
//!
//! - Fixed power-of-two capacity, storage allocated once at construction
//! - `head` (producer-owned) and `tail` (consumer-owned) live on separate
//!   cache lines
//! - Full when `(head + 1) & mask == tail`, so `capacity - 1` slots are usable
//! - Push on a full buffer fails and counts a drop; it never overwrites
//!
//! Exclusive access is enforced by the type system: `try_push`/`try_pop`
//! on the buffer itself need `&mut self`, and [`SpScRingBuffer::split`]
//! hands out exactly one [`Producer`] and one [`Consumer`], neither of
//! which is `Clone`. Any number of [`RingMonitor`]s may read the counters.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring capacity {0} must be a power of two and at least 2")]
    InvalidCapacity(usize),
}

/// Counters written only by the producer side.
#[derive(Default)]
struct ProducerCounters {
    pushed: AtomicU64,
    dropped: AtomicU64,
    high_water_mark: AtomicUsize,
}

/// Point-in-time view of the ring counters. Not linearizable with
/// concurrent push/pop; diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RingStats {
    pub capacity: usize,
    pub len: usize,
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    pub high_water_mark: usize,
}

pub struct SpScRingBuffer<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    producer: CachePadded<ProducerCounters>,
    popped: CachePadded<AtomicU64>,
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Slots are only written through the unique producer path and only read
// through the unique consumer path; the head/tail handoff publishes them.
unsafe impl<T: Send> Send for SpScRingBuffer<T> {}
unsafe impl<T: Send> Sync for SpScRingBuffer<T> {}

impl<T> SpScRingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Result<Self, RingError> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(RingError::InvalidCapacity(capacity));
        }
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            producer: CachePadded::new(ProducerCounters::default()),
            popped: CachePadded::new(AtomicU64::new(0)),
            mask: capacity - 1,
            slots,
        })
    }

    /// Push without blocking. A full buffer hands the item back and bumps
    /// the drop counter; retrying is the caller's decision.
    #[inline]
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        self.push_single_producer(item)
    }

    #[inline]
    pub fn try_pop(&mut self) -> Option<T> {
        self.pop_single_consumer()
    }

    /// Move the buffer behind an `Arc` and split it into its two endpoints.
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        let ring = Arc::new(self);
        (
            Producer { ring: Arc::clone(&ring) },
            Consumer { ring },
        )
    }

    /// Slots in the storage array (one is always kept free).
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Maximum number of items that can be held at once.
    pub fn usable_capacity(&self) -> usize {
        self.mask
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        (head + 1) & self.mask == self.tail.load(Ordering::Acquire)
    }

    pub fn pushed(&self) -> u64 {
        self.producer.pushed.load(Ordering::Relaxed)
    }

    pub fn popped(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.producer.dropped.load(Ordering::Relaxed)
    }

    pub fn high_water_mark(&self) -> usize {
        self.producer.high_water_mark.load(Ordering::Relaxed)
    }

    /// The only way the high-water mark ever goes down.
    pub fn reset_high_water_mark(&self) {
        self.producer.high_water_mark.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            capacity: self.capacity(),
            len: self.len(),
            pushed: self.pushed(),
            popped: self.popped(),
            dropped: self.dropped(),
            high_water_mark: self.high_water_mark(),
        }
    }

    /// Caller must be the only thread pushing.
    #[inline]
    fn push_single_producer(&self, item: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & self.mask;
        let tail = self.tail.load(Ordering::Acquire);
        if next == tail {
            self.producer.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(item);
        }

        // SAFETY: slot `head` is outside [tail, head) so the consumer cannot
        // touch it until the Release store below publishes it.
        unsafe { (*self.slots[head].get()).write(item) };
        self.head.store(next, Ordering::Release);

        self.producer.pushed.fetch_add(1, Ordering::Relaxed);
        self.raise_high_water_mark(next.wrapping_sub(tail) & self.mask);
        Ok(())
    }

    /// Caller must be the only thread popping.
    #[inline]
    fn pop_single_consumer(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: the Acquire load of head guarantees the producer's write to
        // slot `tail` is visible, and the producer will not reuse it until
        // the Release store below.
        let item = unsafe { (*self.slots[tail].get()).assume_init_read() };
        self.tail.store((tail + 1) & self.mask, Ordering::Release);

        self.popped.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    #[inline]
    fn raise_high_water_mark(&self, current: usize) {
        let hwm = &self.producer.high_water_mark;
        let mut prev = hwm.load(Ordering::Relaxed);
        while current > prev {
            match hwm.compare_exchange_weak(prev, current, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(observed) => prev = observed,
            }
        }
    }
}

impl<T> Drop for SpScRingBuffer<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let mut tail = *self.tail.get_mut();
        while tail != head {
            // SAFETY: every slot in [tail, head) holds an initialised item.
            unsafe { self.slots[tail].get_mut().assume_init_drop() };
            tail = (tail + 1) & self.mask;
        }
    }
}

/// The writing endpoint. Exactly one exists per split buffer.
pub struct Producer<T> {
    ring: Arc<SpScRingBuffer<T>>,
}

impl<T> Producer<T> {
    #[inline]
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        self.ring.push_single_producer(item)
    }

    pub fn monitor(&self) -> RingMonitor<T> {
        RingMonitor { ring: Arc::clone(&self.ring) }
    }
}

impl<T> Deref for Producer<T> {
    type Target = SpScRingBuffer<T>;

    fn deref(&self) -> &Self::Target {
        &self.ring
    }
}

/// The reading endpoint. Exactly one exists per split buffer.
pub struct Consumer<T> {
    ring: Arc<SpScRingBuffer<T>>,
}

impl<T> Consumer<T> {
    #[inline]
    pub fn try_pop(&mut self) -> Option<T> {
        self.ring.pop_single_consumer()
    }

    pub fn monitor(&self) -> RingMonitor<T> {
        RingMonitor { ring: Arc::clone(&self.ring) }
    }
}

impl<T> Deref for Consumer<T> {
    type Target = SpScRingBuffer<T>;

    fn deref(&self) -> &Self::Target {
        &self.ring
    }
}

/// Read-only handle for counters and occupancy.
pub struct RingMonitor<T> {
    ring: Arc<SpScRingBuffer<T>>,
}

impl<T> Clone for RingMonitor<T> {
    fn clone(&self) -> Self {
        Self { ring: Arc::clone(&self.ring) }
    }
}

impl<T> Deref for RingMonitor<T> {
    type Target = SpScRingBuffer<T>;

    fn deref(&self) -> &Self::Target {
        &self.ring
    }
}
