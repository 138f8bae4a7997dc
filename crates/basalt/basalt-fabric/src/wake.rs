//! Array-wide wake primitive: a generation counter behind a condition
//! variable.
//!
//! Per-word kernel waits would need one waitable object per cell; instead
//! every mutation of any cell bumps one generation counter and wakes all
//! sleepers, who then recheck the specific word they care about under
//! acquire. Less efficient than a native word-wait, correctness-equivalent.
//!
//! # Protocol
//!
//! **Notifier:** bump generation (release), take the lock, notify all.
//!
//! **Waiter:** snapshot generation, recheck the watched word, then sleep on
//! the condvar; a generation change observed under the lock means some cell
//! changed since the snapshot and the waiter must recheck.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct WakeHub {
    generation: AtomicU64,
    mu: Mutex<()>,
    cv: Condvar,
}

impl WakeHub {
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            mu: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Current generation. Snapshot this before rechecking the watched word.
    #[inline(always)]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Signals that some cell word changed. Wakes every sleeper; each one
    /// rechecks its own cell, so over-waking is safe and under-waking is
    /// impossible.
    pub fn notify(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        let _guard = self.mu.lock().unwrap();
        self.cv.notify_all();
    }

    /// Sleeps until the generation moves past `seen` or `ms` elapses.
    /// Returns true if a generation change was observed. Spurious wakeups
    /// surface as a true return; callers recheck their cell either way.
    pub fn wait_past(&self, seen: u64, ms: u64) -> bool {
        let guard = self.mu.lock().unwrap();
        // Recheck under the lock: a notify between the caller's snapshot and
        // this point must not be slept through.
        if self.generation.load(Ordering::Acquire) != seen {
            return true;
        }
        let (guard, _timeout) = self
            .cv
            .wait_timeout(guard, Duration::from_millis(ms.max(1)))
            .unwrap();
        drop(guard);
        self.generation.load(Ordering::Acquire) != seen
    }

    /// Whether waits are backed by a kernel event object. The condvar hub
    /// is not; the probe stays in the API for callers that tune spin
    /// budgets around it.
    pub fn kernel_backed(&self) -> bool {
        false
    }
}

impl Default for WakeHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn wait_times_out_without_notify() {
        let hub = WakeHub::new();
        let seen = hub.generation();
        let start = Instant::now();
        assert!(!hub.wait_past(seen, 20));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn notify_wakes_a_sleeping_waiter() {
        let hub = Arc::new(WakeHub::new());
        let seen = hub.generation();
        let h2 = Arc::clone(&hub);
        let waiter = std::thread::spawn(move || h2.wait_past(seen, 5_000));
        std::thread::sleep(Duration::from_millis(20));
        hub.notify();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn notify_before_wait_is_not_lost() {
        let hub = WakeHub::new();
        let seen = hub.generation();
        hub.notify();
        // The generation already moved; the wait must return immediately.
        let start = Instant::now();
        assert!(hub.wait_past(seen, 5_000));
        assert!(start.elapsed() < Duration::from_millis(1_000));
    }
}
