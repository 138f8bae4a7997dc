//! Lazy per-region epoch table.
//!
//! The in-cell 16-bit clock wraps quickly under sustained commits; the epoch
//! table extends it to a 64-bit effective timestamp without touching any
//! cell. Each region carries an epoch counter, a dirty flag, and a one-byte
//! CAS lock held only for the duration of an increment.
//!
//! Effective timestamp of a cell: `(epoch[region] << 16) | clk16`.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// Invoked after a winning bump with `(region, new_epoch)`.
pub type EpochCallback = Box<dyn Fn(usize, u64) + Send + Sync>;

/// Per-region clock state. Cache-line sized so concurrent bumps of
/// neighboring regions do not false-share.
#[repr(align(64))]
struct RegionClock {
    epoch: AtomicU64,
    dirty: AtomicBool,
    lock: AtomicU8,
}

impl RegionClock {
    fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            lock: AtomicU8::new(0),
        }
    }
}

pub struct EpochTable {
    region_size: usize,
    regions: Box<[RegionClock]>,
    callback: RwLock<Option<EpochCallback>>,
}

impl EpochTable {
    /// One clock per `region_size` cells; the last region may be short.
    /// `region_size` must be nonzero (validated by the fabric constructor).
    pub fn new(cells: usize, region_size: usize) -> Self {
        let count = cells.div_ceil(region_size);
        let regions = (0..count).map(|_| RegionClock::new()).collect();
        Self {
            region_size,
            regions,
            callback: RwLock::new(None),
        }
    }

    #[inline(always)]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    #[inline(always)]
    pub fn region_of(&self, idx: usize) -> usize {
        idx / self.region_size
    }

    /// Current epoch of `region`; 0 for out-of-range regions.
    #[inline(always)]
    pub fn epoch(&self, region: usize) -> u64 {
        match self.regions.get(region) {
            Some(rc) => rc.epoch.load(Ordering::Acquire),
            None => 0,
        }
    }

    /// Attempts one epoch increment. Exactly one increment happens per
    /// winning lock CAS; losers return false and do not retry here.
    pub fn bump(&self, region: usize) -> bool {
        let Some(rc) = self.regions.get(region) else {
            return false;
        };
        if rc
            .lock
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        // Single writer while the lock byte is held.
        let new_epoch = rc.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        rc.dirty.store(true, Ordering::Relaxed);
        rc.lock.store(0, Ordering::Release);

        if let Some(cb) = self.callback.read().unwrap().as_ref() {
            cb(region, new_epoch);
        }
        true
    }

    /// Replaces the bump callback.
    pub fn set_callback(&self, cb: Option<EpochCallback>) {
        *self.callback.write().unwrap() = cb;
    }

    /// Whether background maintenance owes this region a clock
    /// normalization pass. Never required for ordering correctness.
    pub fn is_dirty(&self, region: usize) -> bool {
        self.regions
            .get(region)
            .map(|rc| rc.dirty.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn clear_dirty(&self, region: usize) {
        if let Some(rc) = self.regions.get(region) {
            rc.dirty.store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn regions_cover_the_array_including_a_short_tail() {
        let t = EpochTable::new(100, 16);
        assert_eq!(t.num_regions(), 7);
        assert_eq!(t.region_of(0), 0);
        assert_eq!(t.region_of(15), 0);
        assert_eq!(t.region_of(16), 1);
        assert_eq!(t.region_of(99), 6);
    }

    #[test]
    fn bump_increments_and_marks_dirty() {
        let t = EpochTable::new(64, 16);
        assert_eq!(t.epoch(1), 0);
        assert!(!t.is_dirty(1));
        assert!(t.bump(1));
        assert_eq!(t.epoch(1), 1);
        assert!(t.is_dirty(1));
        t.clear_dirty(1);
        assert!(!t.is_dirty(1));
    }

    #[test]
    fn out_of_range_region_is_a_no_op() {
        let t = EpochTable::new(64, 16);
        assert!(!t.bump(99));
        assert_eq!(t.epoch(99), 0);
    }

    #[test]
    fn callback_sees_the_new_epoch() {
        let t = EpochTable::new(64, 16);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        t.set_callback(Some(Box::new(move |region, epoch| {
            assert_eq!(region, 2);
            seen2.store(epoch as usize, Ordering::SeqCst);
        })));
        assert!(t.bump(2));
        assert!(t.bump(2));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    /// N threads hammer the same region; the final epoch must equal the
    /// number of calls that reported a win.
    #[test]
    fn contended_bumps_count_exactly_the_winners() {
        let t = Arc::new(EpochTable::new(64, 16));
        let wins = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = Arc::clone(&t);
            let wins = Arc::clone(&wins);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1_000 {
                    if t.bump(0) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.epoch(0), wins.load(Ordering::SeqCst) as u64);
    }
}
