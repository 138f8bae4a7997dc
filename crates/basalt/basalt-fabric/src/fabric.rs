//! The authoritative cell array and its atomic lifecycle protocol.
//!
//! Every cell is one 64-bit word; producers and consumers coordinate
//! exclusively through CAS transitions and release/acquire stores on that
//! word. There is no shadow structure: a consumer that observes a state
//! transition also observes the value bits written in the same word.
//!
//! # Transition graph
//!
//! ```text
//! IDLE ──CAS(producer)──▶ PENDING ──store──▶ PUBLISHED
//! PUBLISHED ──CAS(consumer)──▶ CLAIMED ──store──▶ PROCESSING
//! PROCESSING ──store(consumer)──▶ COMPLETE
//! COMPLETE ──CAS/store(producer)──▶ RETIRED ──store──▶ IDLE
//! ```
//!
//! CAS winners proceed; losers re-read and retry against the fresh word,
//! never against a stale expected value.
//!
//! # Layouts
//!
//! `Aos` keeps one atomic word per cell and commits with a single store.
//! `Soa` additionally stages value/clock/tag planes so the worker can run
//! vectorized commit kernels; a fence orders the staged stores before the
//! release store of the metadata word, which alone publishes the commit.
//! Readers always load the metadata word, in both layouts.

use crate::epoch::{EpochCallback, EpochTable};
use crate::relindex::RelIndex;
use crate::wake::WakeHub;
use basalt_cell::packed::{self, PackedMode, mask_bits};
use basalt_cell::state;
use basalt_numa::{AllocError, NumaRegion};
use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering, fence};
use std::time::{Duration, Instant};

/// Physical arrangement of the cell storage.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Layout {
    /// One atomic 64-bit word per cell.
    Aos,
    /// Split value/clock/tag planes plus the per-cell metadata word.
    Soa,
}

#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("cell count must be nonzero")]
    ZeroCells,

    #[error("epoch region size must be nonzero")]
    ZeroRegionSize,

    #[error("epoch table already initialized")]
    EpochAlreadyInit,

    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Commit sets at or above this size take the streaming-store path.
/// A heuristic, not a contract; transitions stay visible to acquire loads
/// either way.
pub const STREAM_COMMIT_THRESHOLD: usize = 512;

/// One worker-produced commit: the final word for one cell.
#[derive(Debug, Clone, Copy)]
pub struct CommitEntry {
    pub idx: usize,
    pub word: u64,
    /// Cleared when the originating descriptor carried SKIP_NOTIFY.
    pub notify: bool,
}

/// Milliseconds per condvar nap inside `wait_for_change`.
const WAIT_SLICE_MS: u64 = 50;

struct EpochDomain {
    table: EpochTable,
    index: RelIndex,
}

struct SoaPlanes {
    _values: NumaRegion,
    _clocks: NumaRegion,
    _tags: NumaRegion,
    values_base: *const AtomicU32,
    clocks_base: *const AtomicU16,
    tags_base: *const AtomicU16,
}

/// The shared-memory fabric: `n` packed cells plus the epoch table, the
/// relation index and the wake hub that serve them.
pub struct CellFabric {
    n: usize,
    mode: PackedMode,
    layout: Layout,
    _meta: NumaRegion,
    meta_base: *const AtomicU64,
    planes: Option<SoaPlanes>,
    epoch: OnceLock<EpochDomain>,
    wake: WakeHub,
}

// SAFETY: all shared mutation goes through the atomics behind `meta_base`
// and the SoA planes; the raw pointers alias memory owned by the
// NumaRegions stored alongside them, which live exactly as long as the
// fabric.
unsafe impl Send for CellFabric {}
unsafe impl Sync for CellFabric {}

impl CellFabric {
    /// Allocates `n` cells on `numa_node` (or unpinned). All cells start
    /// zeroed: IDLE, clock 0, empty relation.
    pub fn new(
        n: usize,
        mode: PackedMode,
        layout: Layout,
        numa_node: Option<u32>,
    ) -> Result<Self, FabricError> {
        if n == 0 {
            return Err(FabricError::ZeroCells);
        }
        let meta = NumaRegion::new(n * 8, numa_node)?;
        let meta_base = meta.as_ptr() as *const AtomicU64;

        let planes = match layout {
            Layout::Aos => None,
            Layout::Soa => {
                let values = NumaRegion::new(n * 4, numa_node)?;
                let clocks = NumaRegion::new(n * 2, numa_node)?;
                let tags = NumaRegion::new(n * 2, numa_node)?;
                let values_base = values.as_ptr() as *const AtomicU32;
                let clocks_base = clocks.as_ptr() as *const AtomicU16;
                let tags_base = tags.as_ptr() as *const AtomicU16;
                Some(SoaPlanes {
                    _values: values,
                    _clocks: clocks,
                    _tags: tags,
                    values_base,
                    clocks_base,
                    tags_base,
                })
            }
        };

        Ok(Self {
            n,
            mode,
            layout,
            _meta: meta,
            meta_base,
            planes,
            epoch: OnceLock::new(),
            wake: WakeHub::new(),
        })
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.n
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn mode(&self) -> PackedMode {
        self.mode
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Base address of the metadata words. Page-aligned and backed by an
    /// anonymous mapping, so a co-processor driver can map the same
    /// physical pages and run the identical CAS protocol against them.
    pub fn raw_ptr(&self) -> *const u64 {
        self.meta_base as *const u64
    }

    #[inline(always)]
    fn slot(&self, idx: usize) -> &AtomicU64 {
        debug_assert!(idx < self.n);
        // SAFETY: callers bounds-check idx; the word lives inside the
        // owned mapping.
        unsafe { &*self.meta_base.add(idx) }
    }

    /// Folds a freshly written word's relation bits into the region index.
    /// Must run after the word store so a concurrent index rebuild cannot
    /// lose the bits.
    #[inline(always)]
    fn note_rel(&self, idx: usize, w: u64) {
        if let Some(d) = self.epoch.get() {
            d.index.note_write(idx, packed::rel(w));
        }
    }

    /// Bumps the region epoch when a commit's clock wrapped past its
    /// predecessor, keeping effective timestamps monotonic.
    #[inline(always)]
    fn bump_on_wrap(&self, idx: usize, before: u64, after: u64) {
        let wrapped = match self.mode {
            PackedMode::Value32 => packed::value32::clk(after) < packed::value32::clk(before),
            PackedMode::Clk48 => packed::clk48::clk(after) < packed::clk48::clk(before),
        };
        if wrapped {
            if let Some(d) = self.epoch.get() {
                d.table.bump(d.table.region_of(idx));
            }
        }
    }

    // ── Word-level operations ───────────────────────────────────────────

    /// Current word with acquire semantics. Out-of-range reads the zero
    /// word.
    #[inline(always)]
    pub fn load(&self, idx: usize) -> u64 {
        if idx >= self.n {
            return 0;
        }
        self.slot(idx).load(Ordering::Acquire)
    }

    /// Release-publishes `w` and wakes waiters. Out-of-range is a no-op.
    pub fn store(&self, idx: usize, w: u64) {
        if idx >= self.n {
            return;
        }
        self.slot(idx).store(w, Ordering::Release);
        self.note_rel(idx, w);
        self.wake.notify();
    }

    /// Swaps in `w`, returning the previous word. Out-of-range returns the
    /// zero word without storing.
    pub fn exchange(&self, idx: usize, w: u64) -> u64 {
        if idx >= self.n {
            return 0;
        }
        let prev = self.slot(idx).swap(w, Ordering::AcqRel);
        self.note_rel(idx, w);
        self.wake.notify();
        prev
    }

    /// Builds the PENDING word a reservation would install over `observed`:
    /// payload kept, clock stamped odd, state PENDING, relation replaced.
    pub fn make_pending(&self, observed: u64, batch_lo: u16, rel_hint: u8) -> u64 {
        match self.mode {
            PackedMode::Value32 => packed::value32::pack(
                packed::value32::value(observed),
                batch_lo | 1,
                state::ST_PENDING,
                rel_hint,
            ),
            PackedMode::Clk48 => packed::clk48::pack(
                packed::clk48::clk(observed) | 1,
                state::ST_PENDING,
                rel_hint,
            ),
        }
    }

    /// Attempts the transition `expected_old` → PENDING. The CAS honors the
    /// caller-supplied expectation exactly; a concurrent modification loses
    /// and the caller must re-read before retrying.
    pub fn reserve(&self, idx: usize, expected_old: u64, batch_lo: u16, rel_hint: u8) -> bool {
        if idx >= self.n {
            return false;
        }
        let pending = self.make_pending(expected_old, batch_lo, rel_hint);
        let ok = self
            .slot(idx)
            .compare_exchange(expected_old, pending, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        if ok {
            self.note_rel(idx, pending);
            self.wake.notify();
        }
        ok
    }

    /// Loads the current word and reserves against that snapshot in one
    /// call. Returns the observed pre-reservation word on success. Weaker
    /// than [`reserve`](Self::reserve): the expectation is whatever was
    /// read, not what the caller saw earlier.
    pub fn try_reserve_from_load(&self, idx: usize, batch_lo: u16, rel_hint: u8) -> Option<u64> {
        if idx >= self.n {
            return None;
        }
        let observed = self.slot(idx).load(Ordering::Acquire);
        let pending = self.make_pending(observed, batch_lo, rel_hint);
        match self
            .slot(idx)
            .compare_exchange(observed, pending, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => {
                self.note_rel(idx, pending);
                self.wake.notify();
                Some(observed)
            }
            Err(_) => None,
        }
    }

    /// Finishes a reservation: CAS `expected_pending` → `committed`.
    /// A lost CAS falls through to an unconditional release store of
    /// `committed`, trading strict isolation for forward progress; the
    /// return value reports whether the CAS itself won.
    pub fn commit(&self, idx: usize, expected_pending: u64, committed: u64) -> bool {
        if idx >= self.n {
            return false;
        }
        self.bump_on_wrap(idx, expected_pending, committed);
        let ok = self
            .slot(idx)
            .compare_exchange(expected_pending, committed, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        if !ok {
            self.slot(idx).store(committed, Ordering::Release);
        }
        self.note_rel(idx, committed);
        self.wake.notify();
        ok
    }

    /// Consumer claim: CAS PUBLISHED → CLAIMED. Success transfers cell
    /// ownership to the calling thread; failure means another consumer won
    /// and the caller must not mutate the cell.
    pub fn try_claim(&self, idx: usize, expected_published: u64, claimed: u64) -> bool {
        if idx >= self.n {
            return false;
        }
        let ok = self
            .slot(idx)
            .compare_exchange(
                expected_published,
                claimed,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok();
        if ok {
            self.note_rel(idx, claimed);
            self.wake.notify();
        }
        ok
    }

    /// Release-stores the claimer's result word and wakes waiters.
    pub fn mark_complete(&self, idx: usize, word: u64) {
        if idx >= self.n {
            return;
        }
        let before = self.slot(idx).load(Ordering::Acquire);
        self.bump_on_wrap(idx, before, word);
        self.slot(idx).store(word, Ordering::Release);
        self.note_rel(idx, word);
        self.wake.notify();
    }

    /// Producer one-shot: runs the full IDLE/committed → PENDING →
    /// PUBLISHED cycle for `idx`, advancing the cell clock by two. Spins
    /// (then naps) while another writer holds the cell PENDING. Returns
    /// false only for out-of-range indices.
    ///
    /// In CLK48 mode the payload is carried by the clock alone and `value`
    /// is ignored.
    pub fn publish(&self, idx: usize, value: u32, rel: u8) -> bool {
        if idx >= self.n {
            return false;
        }
        let mut spins = 0u32;
        loop {
            let old = self.load(idx);
            if packed::is_pending(old, self.mode) {
                spins += 1;
                if spins < 64 {
                    std::hint::spin_loop();
                } else {
                    self.wait_for_change(idx, old, 1);
                }
                continue;
            }
            let (pending, committed) = match self.mode {
                PackedMode::Value32 => {
                    let clk = packed::value32::clk(old);
                    (
                        packed::value32::pack(value, clk.wrapping_add(1), state::ST_PENDING, rel),
                        packed::value32::pack(value, clk.wrapping_add(2), state::ST_PUBLISHED, rel),
                    )
                }
                PackedMode::Clk48 => {
                    let clk = packed::clk48::clk(old);
                    (
                        packed::clk48::pack((clk + 1) & mask_bits(48), state::ST_PENDING, rel),
                        packed::clk48::pack((clk + 2) & mask_bits(48), state::ST_PUBLISHED, rel),
                    )
                }
            };
            if self
                .slot(idx)
                .compare_exchange(old, pending, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.bump_on_wrap(idx, old, committed);
                self.slot(idx).store(committed, Ordering::Release);
                self.note_rel(idx, committed);
                self.wake.notify();
                return true;
            }
            // Lost the reservation CAS: re-read and restart.
            spins = 0;
        }
    }

    /// CAS-loop clock advance preserving value, state and relation.
    /// VALUE32 only; returns the new word, or the zero word for CLK48 mode
    /// and out-of-range indices.
    pub fn try_increment_clk(&self, idx: usize, increment: u16) -> u64 {
        if self.mode != PackedMode::Value32 || idx >= self.n {
            return 0;
        }
        let mut old = self.slot(idx).load(Ordering::Acquire);
        loop {
            let desired =
                packed::value32::with_clk(old, packed::value32::clk(old).wrapping_add(increment));
            match self
                .slot(idx)
                .compare_exchange(old, desired, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.wake.notify();
                    return desired;
                }
                Err(cur) => old = cur,
            }
        }
    }

    // ── Field-selective loads ───────────────────────────────────────────

    /// The 32-bit payload; 0 for CLK48 mode or out-of-range.
    pub fn value32_at(&self, idx: usize) -> u32 {
        match self.mode {
            PackedMode::Value32 => packed::value32::value(self.load(idx)),
            PackedMode::Clk48 => 0,
        }
    }

    pub fn clk16_at(&self, idx: usize) -> u16 {
        packed::value32::clk(self.load(idx))
    }

    pub fn clk48_at(&self, idx: usize) -> u64 {
        packed::clk48::clk(self.load(idx))
    }

    pub fn state_at(&self, idx: usize) -> u8 {
        packed::state(self.load(idx))
    }

    pub fn rel_at(&self, idx: usize) -> u8 {
        packed::rel(self.load(idx))
    }

    // ── Epoch table ─────────────────────────────────────────────────────

    /// Partitions the array into regions of `region_size` cells, creating
    /// the epoch table and the relation index. The index is seeded from the
    /// cells' current relation bits, so this must run before concurrent
    /// publication begins. One-shot: a second call fails.
    pub fn init_epoch(&self, region_size: usize) -> Result<(), FabricError> {
        if region_size == 0 {
            return Err(FabricError::ZeroRegionSize);
        }
        let domain = EpochDomain {
            table: EpochTable::new(self.n, region_size),
            index: RelIndex::new(self.n, region_size),
        };
        for i in 0..self.n {
            domain.index.note_write(i, packed::rel(self.load(i)));
        }
        self.epoch
            .set(domain)
            .map_err(|_| FabricError::EpochAlreadyInit)
    }

    /// Region owning `idx`; 0 before `init_epoch`.
    pub fn region_of(&self, idx: usize) -> usize {
        match self.epoch.get() {
            Some(d) => d.table.region_of(idx),
            None => 0,
        }
    }

    /// Attempts an epoch bump; false when the table is uninitialized, the
    /// region is out of range, or another bumper holds the region lock.
    pub fn bump_region(&self, region: usize) -> bool {
        match self.epoch.get() {
            Some(d) => d.table.bump(region),
            None => false,
        }
    }

    /// Installs the epoch-bump callback. False before `init_epoch`.
    pub fn set_epoch_callback(&self, cb: EpochCallback) -> bool {
        match self.epoch.get() {
            Some(d) => {
                d.table.set_callback(Some(cb));
                true
            }
            None => false,
        }
    }

    pub fn region_epoch(&self, region: usize) -> u64 {
        match self.epoch.get() {
            Some(d) => d.table.epoch(region),
            None => 0,
        }
    }

    pub fn region_dirty(&self, region: usize) -> bool {
        match self.epoch.get() {
            Some(d) => d.table.is_dirty(region),
            None => false,
        }
    }

    pub fn clear_region_dirty(&self, region: usize) {
        if let Some(d) = self.epoch.get() {
            d.table.clear_dirty(region);
        }
    }

    /// Effective logical time of `idx`. VALUE32: `(epoch << 16) | clk16`,
    /// monotonic per cell across commits. CLK48: the in-word clock itself.
    pub fn effective_ts(&self, idx: usize) -> u64 {
        if idx >= self.n {
            return 0;
        }
        let w = self.load(idx);
        match self.mode {
            PackedMode::Value32 => {
                let epoch = match self.epoch.get() {
                    Some(d) => d.table.epoch(d.table.region_of(idx)),
                    None => 0,
                };
                (epoch << 16) | packed::value32::clk(w) as u64
            }
            PackedMode::Clk48 => packed::clk48::clk(w),
        }
    }

    /// Maintenance hook: recomputes one region's relation accumulation from
    /// the live cells. Resets before rescanning, so concurrently written
    /// bits are either seen by the rescan or re-noted by their writer.
    pub fn rebuild_rel_index(&self, region: usize) {
        let Some(d) = self.epoch.get() else {
            return;
        };
        let rs = d.index.region_size();
        let start = region * rs;
        if start >= self.n {
            return;
        }
        d.index.reset_region(region);
        for i in start..(start + rs).min(self.n) {
            d.index.note_write(i, packed::rel(self.load(i)));
        }
    }

    // ── Scanning ────────────────────────────────────────────────────────

    /// Returns `(start, len)` for each maximal run of consecutive cells
    /// whose relation overlaps `mask`, in index order. Regions whose
    /// accumulated relation mask cannot overlap are skipped wholesale; the
    /// index never under-reports, so no run is cut short.
    pub fn scan_relation(&self, mask: u8) -> Vec<(usize, usize)> {
        let mut runs = Vec::new();
        if mask == 0 {
            return runs;
        }
        let domain = self.epoch.get();
        let mut i = 0usize;
        while i < self.n {
            if let Some(d) = domain {
                let rs = d.index.region_size();
                if i % rs == 0 && !d.index.may_contain(i / rs, mask) {
                    i += rs;
                    continue;
                }
            }
            if packed::rel_matches(packed::rel(self.load(i)), mask) {
                let start = i;
                i += 1;
                while i < self.n && packed::rel_matches(packed::rel(self.load(i)), mask) {
                    i += 1;
                }
                runs.push((start, i - start));
            } else {
                i += 1;
            }
        }
        runs
    }

    // ── Waiting ─────────────────────────────────────────────────────────

    /// Blocks until the word at `idx` differs from `expected` or the
    /// timeout elapses. Negative timeout waits indefinitely. Robust against
    /// spurious wakeups: every wake rechecks the word under acquire.
    pub fn wait_for_change(&self, idx: usize, expected: u64, timeout_ms: i64) -> bool {
        if idx >= self.n {
            return false;
        }
        let deadline = if timeout_ms >= 0 {
            Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
        } else {
            None
        };
        loop {
            let seen = self.wake.generation();
            if self.load(idx) != expected {
                return true;
            }
            let slice = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    (d.duration_since(now).as_millis() as u64).clamp(1, WAIT_SLICE_MS)
                }
                None => WAIT_SLICE_MS,
            };
            self.wake.wait_past(seen, slice);
        }
    }

    /// Whether waits are kernel-event backed (see [`WakeHub::kernel_backed`]).
    pub fn wait_kernel_backed(&self) -> bool {
        self.wake.kernel_backed()
    }

    // ── Worker commit path ──────────────────────────────────────────────

    /// Publishes a batch of worker commits. Sets of
    /// [`STREAM_COMMIT_THRESHOLD`] or more use streaming stores followed by
    /// a store fence to keep bulk commits out of the cache; smaller sets
    /// use ordinary release stores. Waiters are woken once per batch unless
    /// every entry opted out.
    pub fn commit_batch(&self, commits: &[CommitEntry]) {
        if commits.is_empty() {
            return;
        }
        let streaming = commits.len() >= STREAM_COMMIT_THRESHOLD;
        match self.layout {
            Layout::Aos => self.commit_batch_aos(commits, streaming),
            Layout::Soa => self.commit_batch_soa(commits, streaming),
        }
    }

    fn commit_batch_aos(&self, commits: &[CommitEntry], streaming: bool) {
        let mut wake = false;
        if streaming {
            for c in commits {
                if c.idx >= self.n {
                    continue;
                }
                self.stream_store_word(c.idx, c.word);
                self.note_rel(c.idx, c.word);
                wake |= c.notify;
            }
            stream_fence();
        } else {
            for c in commits {
                if c.idx >= self.n {
                    continue;
                }
                self.slot(c.idx).store(c.word, Ordering::Release);
                self.note_rel(c.idx, c.word);
                wake |= c.notify;
            }
        }
        if wake {
            self.wake.notify();
        }
    }

    fn commit_batch_soa(&self, commits: &[CommitEntry], streaming: bool) {
        let Some(planes) = &self.planes else {
            return;
        };
        // Stage the planes first.
        for c in commits {
            if c.idx >= self.n {
                continue;
            }
            let (value, clk, st, rel) = match self.mode {
                PackedMode::Value32 => (
                    packed::value32::value(c.word),
                    packed::value32::clk(c.word),
                    packed::state(c.word),
                    packed::rel(c.word),
                ),
                PackedMode::Clk48 => (
                    packed::clk48::clk(c.word) as u32,
                    packed::clk48::clk(c.word) as u16,
                    packed::state(c.word),
                    packed::rel(c.word),
                ),
            };
            if streaming {
                self.stream_store_value(c.idx, value);
            } else {
                // SAFETY: idx is in range; the plane slots are atomics in
                // the owned mappings.
                unsafe {
                    (*planes.values_base.add(c.idx)).store(value, Ordering::Relaxed);
                }
            }
            // SAFETY: as above.
            unsafe {
                (*planes.clocks_base.add(c.idx)).store(clk, Ordering::Relaxed);
                (*planes.tags_base.add(c.idx)).store(((st as u16) << 8) | rel as u16, Ordering::Relaxed);
            }
        }
        // Order staged plane stores before the metadata stores that publish
        // the commits.
        if streaming {
            stream_fence();
        } else {
            fence(Ordering::Release);
        }
        let mut wake = false;
        for c in commits {
            if c.idx >= self.n {
                continue;
            }
            self.slot(c.idx).store(c.word, Ordering::Release);
            self.note_rel(c.idx, c.word);
            wake |= c.notify;
        }
        if wake {
            self.wake.notify();
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    fn stream_store_word(&self, idx: usize, word: u64) {
        // SAFETY: idx is bounds-checked by the caller; the streamed store
        // targets the cell's own 64-bit slot and is ordered by the batch
        // fence before anything observes it through the wake hub.
        unsafe {
            core::arch::x86_64::_mm_stream_si64(self.meta_base.add(idx) as *mut i64, word as i64);
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    #[inline(always)]
    fn stream_store_word(&self, idx: usize, word: u64) {
        self.slot(idx).store(word, Ordering::Release);
    }

    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    fn stream_store_value(&self, idx: usize, value: u32) {
        if let Some(planes) = &self.planes {
            // SAFETY: idx is bounds-checked by the caller; ordered by the
            // batch fence before the metadata publish.
            unsafe {
                core::arch::x86_64::_mm_stream_si32(
                    planes.values_base.add(idx) as *mut i32,
                    value as i32,
                );
            }
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    #[inline(always)]
    fn stream_store_value(&self, idx: usize, value: u32) {
        if let Some(planes) = &self.planes {
            // SAFETY: idx is bounds-checked by the caller.
            unsafe {
                (*planes.values_base.add(idx)).store(value, Ordering::Relaxed);
            }
        }
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    /// Human-readable dump of a cell range, clamped to the array.
    pub fn dump_range(&self, start: usize, len: usize) -> String {
        let mut out = String::new();
        for i in start..(start + len).min(self.n) {
            let w = self.load(i);
            let st = state::state_name(packed::state(w));
            match self.mode {
                PackedMode::Value32 => {
                    let _ = writeln!(
                        out,
                        "[{i}] val={:#010x} clk={} st={st} rel={:#04x}",
                        packed::value32::value(w),
                        packed::value32::clk(w),
                        packed::rel(w),
                    );
                }
                PackedMode::Clk48 => {
                    let _ = writeln!(
                        out,
                        "[{i}] clk48={} st={st} rel={:#04x}",
                        packed::clk48::clk(w),
                        packed::rel(w),
                    );
                }
            }
        }
        out
    }
}

#[inline(always)]
fn stream_fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: sfence has no preconditions.
    unsafe {
        core::arch::x86_64::_mm_sfence()
    };
    #[cfg(not(target_arch = "x86_64"))]
    fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_cell::packed::{rel, state, value32};
    use basalt_cell::state::*;

    fn fabric(n: usize) -> CellFabric {
        CellFabric::new(n, PackedMode::Value32, Layout::Aos, None).expect("fabric")
    }

    #[test]
    fn out_of_range_ops_return_sentinels() {
        let f = fabric(8);
        assert_eq!(f.load(8), 0);
        assert_eq!(f.exchange(9, 1), 0);
        assert!(!f.reserve(8, 0, 0, 0));
        assert!(!f.commit(8, 0, 1));
        assert!(!f.try_claim(8, 0, 1));
        assert!(!f.wait_for_change(8, 0, 1));
        f.store(8, 1); // no-op, must not panic
        assert_eq!(f.effective_ts(8), 0);
    }

    #[test]
    fn publish_produces_even_clock_and_published_state() {
        let f = fabric(16);
        assert!(f.publish(3, 0xAABB_CCDD, 0x02));
        let w = f.load(3);
        assert_eq!(value32::value(w), 0xAABB_CCDD);
        assert_eq!(state(w), ST_PUBLISHED);
        assert_eq!(rel(w), 0x02);
        assert_eq!(value32::clk(w) & 1, 0);
        assert_eq!(value32::clk(w), 2);
    }

    #[test]
    fn reserve_honors_the_caller_expectation() {
        let f = fabric(4);
        let observed = f.load(0);
        // Someone else slips in a publish: the stale expectation must lose.
        assert!(f.publish(0, 7, 0x01));
        assert!(!f.reserve(0, observed, 5, 0x01));
        // A fresh read wins.
        let fresh = f.load(0);
        assert!(f.reserve(0, fresh, 5, 0x01));
        assert_eq!(state(f.load(0)), ST_PENDING);
        assert_eq!(f.clk16_at(0) & 1, 1);
    }

    #[test]
    fn commit_falls_through_on_cas_loss() {
        let f = fabric(4);
        let old = f.load(1);
        assert!(f.reserve(1, old, 3, 0x04));
        let pending = f.load(1);
        let committed = value32::pack(99, 4, ST_COMPLETE, 0x04);
        // Wrong expectation: CAS loses but the word is still published.
        assert!(!f.commit(1, pending ^ 1, committed));
        assert_eq!(f.load(1), committed);
        // Clean reserve/commit reports the CAS win.
        let old = f.load(2);
        assert!(f.reserve(2, old, 3, 0x04));
        let pending = f.load(2);
        assert!(f.commit(2, pending, value32::pack(1, 6, ST_PUBLISHED, 0x04)));
    }

    #[test]
    fn try_claim_transfers_ownership_once() {
        let f = fabric(4);
        f.publish(2, 11, 0x01);
        let published = f.load(2);
        let claimed = packed::with_state(published, ST_CLAIMED);
        assert!(f.try_claim(2, published, claimed));
        // Second claim against the now-stale word loses.
        assert!(!f.try_claim(2, published, claimed));
        assert_eq!(f.state_at(2), ST_CLAIMED);
    }

    #[test]
    fn try_reserve_from_load_returns_the_snapshot() {
        let f = fabric(4);
        f.publish(0, 5, 0x02);
        let before = f.load(0);
        let observed = f.try_reserve_from_load(0, 9, 0x02).expect("reserve");
        assert_eq!(observed, before);
        assert_eq!(f.state_at(0), ST_PENDING);
        assert_eq!(f.try_reserve_from_load(9, 0, 0), None);
    }

    #[test]
    fn try_increment_clk_preserves_the_other_fields() {
        let f = fabric(4);
        f.store(0, value32::pack(42, 10, ST_PUBLISHED, 0x08));
        let w = f.try_increment_clk(0, 2);
        assert_eq!(value32::value(w), 42);
        assert_eq!(value32::clk(w), 12);
        assert_eq!(state(w), ST_PUBLISHED);
        assert_eq!(rel(w), 0x08);

        let clk = CellFabric::new(4, PackedMode::Clk48, Layout::Aos, None).unwrap();
        assert_eq!(clk.try_increment_clk(0, 1), 0);
    }

    #[test]
    fn scan_finds_runs_with_holes() {
        let f = fabric(16);
        for &i in &[2usize, 3, 4, 10, 14, 15] {
            f.publish(i, 0, 0x08);
        }
        assert_eq!(f.scan_relation(0x08), vec![(2, 3), (10, 1), (14, 2)]);
    }

    #[test]
    fn scan_matches_by_overlap_not_equality() {
        let f = fabric(8);
        f.publish(1, 0, 0x03);
        f.publish(2, 0, 0x02);
        // 0x03 and 0x02 both overlap mask 0x02; 0x01 does not match 0x02.
        f.publish(3, 0, 0x01);
        assert_eq!(f.scan_relation(0x02), vec![(1, 2)]);
        assert_eq!(f.scan_relation(0x01), vec![(1, 1), (3, 1)]);
    }

    #[test]
    fn region_index_skips_do_not_lose_runs() {
        let f = fabric(64);
        f.init_epoch(16).unwrap();
        f.publish(30, 0, 0x04);
        f.publish(31, 0, 0x04);
        f.publish(32, 0, 0x04); // run crosses the region boundary
        assert_eq!(f.scan_relation(0x04), vec![(30, 3)]);
    }

    #[test]
    fn index_seeded_from_cells_written_before_init() {
        let f = fabric(64);
        f.publish(40, 0, 0x20);
        f.init_epoch(16).unwrap();
        assert_eq!(f.scan_relation(0x20), vec![(40, 1)]);
    }

    #[test]
    fn effective_ts_tracks_epoch_and_clock() {
        let f = fabric(64);
        f.init_epoch(16).unwrap();
        f.publish(0, 1, 0x01);
        assert_eq!(f.effective_ts(0), 2);
        assert!(f.bump_region(0));
        assert_eq!(f.effective_ts(0), (1 << 16) | 2);
        // Another region's epoch does not leak in.
        f.publish(20, 1, 0x01);
        assert_eq!(f.effective_ts(20), 2);
    }

    #[test]
    fn init_epoch_validates_and_is_one_shot() {
        let f = fabric(8);
        assert!(matches!(
            f.init_epoch(0),
            Err(FabricError::ZeroRegionSize)
        ));
        f.init_epoch(4).unwrap();
        assert!(matches!(
            f.init_epoch(4),
            Err(FabricError::EpochAlreadyInit)
        ));
    }

    #[test]
    fn zero_cells_is_rejected() {
        assert!(matches!(
            CellFabric::new(0, PackedMode::Value32, Layout::Aos, None),
            Err(FabricError::ZeroCells)
        ));
    }

    #[test]
    fn soa_commits_publish_through_the_metadata_word() {
        let f = CellFabric::new(16, PackedMode::Value32, Layout::Soa, None).expect("fabric");
        let commits: Vec<CommitEntry> = (0..8)
            .map(|i| CommitEntry {
                idx: i,
                word: value32::pack(i as u32 * 10, 2, ST_COMPLETE, 0x04),
                notify: true,
            })
            .collect();
        f.commit_batch(&commits);
        for i in 0..8 {
            assert_eq!(f.value32_at(i), i as u32 * 10);
            assert_eq!(f.state_at(i), ST_COMPLETE);
        }
    }

    #[test]
    fn large_commit_batches_take_the_streaming_path() {
        let f = fabric(1024);
        let commits: Vec<CommitEntry> = (0..STREAM_COMMIT_THRESHOLD)
            .map(|i| CommitEntry {
                idx: i,
                word: value32::pack(i as u32, 2, ST_PUBLISHED, 0x01),
                notify: false,
            })
            .collect();
        f.commit_batch(&commits);
        for i in 0..STREAM_COMMIT_THRESHOLD {
            assert_eq!(f.value32_at(i), i as u32);
            assert_eq!(f.state_at(i), ST_PUBLISHED);
        }
    }

    #[test]
    fn raw_ptr_is_page_aligned_and_live() {
        let f = fabric(4);
        f.publish(0, 0x1234, 0x01);
        let p = f.raw_ptr();
        assert_eq!(p as usize % basalt_numa::page_size(), 0);
        // The pointer views the same authoritative words.
        let direct = unsafe { std::ptr::read_volatile(p) };
        assert_eq!(direct, f.load(0));
    }

    #[test]
    fn dump_range_names_states() {
        let f = fabric(8);
        f.publish(1, 0xFF, 0x02);
        let dump = f.dump_range(0, 3);
        assert!(dump.contains("IDLE"));
        assert!(dump.contains("PUBLISHED"));
        assert!(dump.contains("0x000000ff"));
    }

    #[test]
    fn clk48_mode_publishes_by_advancing_the_wide_clock() {
        let f = CellFabric::new(8, PackedMode::Clk48, Layout::Aos, None).unwrap();
        f.publish(0, 0, 0x01);
        f.publish(0, 0, 0x01);
        let w = f.load(0);
        assert_eq!(basalt_cell::clk48::clk(w), 4);
        assert_eq!(state(w), ST_PUBLISHED);
        assert_eq!(f.effective_ts(0), 4);
    }
}
