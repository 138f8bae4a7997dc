//! `basalt-queue`: the bounded MPMC descriptor mailbox.
//!
//! A sequence-counted ring buffer of power-of-two capacity. Each slot
//! carries its own sequence counter; the counter's distance from a cursor
//! position encodes the slot's lifecycle:
//!
//! ```text
//! seq == pos             slot is empty, writable by producer at pos
//! seq == pos + 1         slot is filled, readable by consumer at pos
//! seq == pos + capacity  slot is empty again, one cycle later
//! ```
//!
//! Producers CAS the producer cursor to win a slot, write the payload, and
//! release-store the slot sequence; consumers mirror the protocol. Losers
//! reload the cursor and retry. The queue is lock-free: one contender
//! always wins each CAS.
//!
//! FIFO holds per producer; global order across producers is unspecified.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Advisory backpressure signal, invoked with `(occupancy, capacity)` when
/// a push observes occupancy at or above 80% of capacity. Occupancy is a
/// cursor-difference estimate, not an exact count.
pub type HighWaterCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Microseconds slept between retries inside `push_blocking`.
const PUSH_RETRY_SLEEP_US: u64 = 50;

#[repr(align(64))]
struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: a slot's value is only touched by the unique cursor winner while
// the sequence counter marks the slot as owned by that side.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

/// Bounded multi-producer multi-consumer queue of `Copy` payloads.
pub struct MpmcQueue<T: Copy> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    /// Next position a producer will try to win.
    head: CachePadded<AtomicUsize>,
    /// Next position a consumer will try to win.
    tail: CachePadded<AtomicUsize>,
    high_water: Option<HighWaterCallback>,
}

impl<T: Copy> MpmcQueue<T> {
    /// Creates a queue with `capacity` slots.
    ///
    /// # Panics
    /// Panics if `capacity` is zero or not a power of 2.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Like [`new`](Self::new), with a high-water callback installed.
    pub fn with_high_water(capacity: usize, cb: HighWaterCallback) -> Self {
        Self::build(capacity, Some(cb))
    }

    fn build(capacity: usize, high_water: Option<HighWaterCallback>) -> Self {
        assert!(capacity > 0, "capacity must be nonzero");
        assert!(
            capacity.is_power_of_two(),
            "capacity must be a power of 2"
        );
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            high_water,
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Cursor-difference occupancy estimate. Exact only at quiescence.
    pub fn occupancy(&self) -> usize {
        let h = self.head.load(Ordering::Relaxed);
        let t = self.tail.load(Ordering::Relaxed);
        h.saturating_sub(t)
    }

    /// Non-blocking enqueue. Returns false when the ring is full; the
    /// caller decides whether to drop, retry, or apply backpressure.
    pub fn push(&self, value: T) -> bool {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the cursor CAS while seq == pos
                        // grants exclusive write access to this slot.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.seq.store(pos + 1, Ordering::Release);
                        self.check_high_water(pos + 1);
                        return true;
                    }
                    Err(cur) => pos = cur,
                }
            } else if diff < 0 {
                // The slot still holds an unconsumed value from the
                // previous lap: the ring is full.
                return false;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueue with retry: spins with short sleeps until the push lands or
    /// the deadline passes. Negative timeout retries indefinitely.
    pub fn push_blocking(&self, value: T, timeout_ms: i64) -> bool {
        let deadline = if timeout_ms >= 0 {
            Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
        } else {
            None
        };
        loop {
            if self.push(value) {
                return true;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return false;
                }
            }
            std::thread::sleep(Duration::from_micros(PUSH_RETRY_SLEEP_US));
        }
    }

    /// Non-blocking dequeue.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - (pos + 1) as isize;
            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the cursor CAS while
                        // seq == pos + 1 grants exclusive read access, and
                        // the producer initialized the value before its
                        // release store of seq.
                        let value = unsafe { (*slot.value.get()).assume_init() };
                        slot.seq.store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(cur) => pos = cur,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Opportunistically pops up to `max` items into `out`, amortizing
    /// scheduling over a batch. Returns the number collected.
    pub fn drain_batch(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut taken = 0;
        while taken < max {
            match self.pop() {
                Some(v) => {
                    out.push(v);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    #[inline]
    fn check_high_water(&self, head_pos: usize) {
        if let Some(cb) = &self.high_water {
            let occ = head_pos.saturating_sub(self.tail.load(Ordering::Relaxed));
            if occ * 10 >= self.capacity() * 8 {
                cb(occ, self.capacity());
            }
        }
    }
}
