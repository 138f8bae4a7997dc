//! The asynchronous commit worker.
//!
//! One dedicated thread drains the descriptor mailbox in batches, coalesces
//! descriptors into contiguous same-relation groups, computes the new cell
//! words, and publishes them through the fabric's batched commit path.
//! Producers keep submitting while a batch is in flight; the queue absorbs
//! the jitter.
//!
//! Batch ids are stamped into the cells' 16-bit clocks shifted left by one,
//! so committed words keep an even clock while readers still see the low
//! batch bits as a coarse ordering signal.

use basalt_cell::packed::{self, PackedMode};
use basalt_cell::state;
use basalt_cell::{Descriptor, flag, op};
use basalt_fabric::{CellFabric, CommitEntry};
use basalt_queue::MpmcQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};
use wide::i32x8;

/// Descriptors drained per loop iteration.
const DRAIN_MAX: usize = 1024;

/// Nap taken when the mailbox is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

struct WorkerCore {
    fabric: Arc<CellFabric>,
    queue: Arc<MpmcQueue<Descriptor>>,
    running: AtomicBool,
    next_batch_id: AtomicU64,
    undo: Mutex<HashMap<u64, Vec<(usize, u64)>>>,
    reserve_misses: AtomicU64,
    batches: AtomicU64,
}

/// Owns one mailbox and one worker thread over a shared fabric.
///
/// `start` and `stop` are idempotent; dropping the worker stops it. Any
/// descriptors still queued when the worker stops are discarded.
pub struct AsyncWorker {
    core: Arc<WorkerCore>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncWorker {
    /// Creates a worker with its own mailbox of `queue_capacity` slots
    /// (power of 2).
    pub fn new(fabric: Arc<CellFabric>, queue_capacity: usize) -> Self {
        Self::with_queue(fabric, Arc::new(MpmcQueue::new(queue_capacity)))
    }

    /// Creates a worker draining an externally owned mailbox, e.g. one
    /// with a high-water callback installed.
    pub fn with_queue(fabric: Arc<CellFabric>, queue: Arc<MpmcQueue<Descriptor>>) -> Self {
        Self {
            core: Arc::new(WorkerCore {
                fabric,
                queue,
                running: AtomicBool::new(false),
                next_batch_id: AtomicU64::new(1),
                undo: Mutex::new(HashMap::new()),
                reserve_misses: AtomicU64::new(0),
                batches: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
        }
    }

    /// The mailbox this worker drains.
    pub fn queue(&self) -> Arc<MpmcQueue<Descriptor>> {
        Arc::clone(&self.core.queue)
    }

    /// Non-blocking submit; false when the mailbox is full.
    pub fn submit(&self, d: Descriptor) -> bool {
        self.core.queue.push(d)
    }

    /// Submit with retry until the deadline. Negative timeout retries
    /// indefinitely.
    pub fn submit_blocking(&self, d: Descriptor, timeout_ms: i64) -> bool {
        self.core.queue.push_blocking(d, timeout_ms)
    }

    /// Spawns the worker thread. A second call while running is a no-op.
    pub fn start(&self) {
        if self
            .core
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let core = Arc::clone(&self.core);
        let handle = std::thread::Builder::new()
            .name("basalt-worker".into())
            .spawn(move || core.run())
            .expect("failed to spawn worker thread");
        *self.handle.lock().unwrap() = Some(handle);
        debug!("worker started");
    }

    /// Clears the running flag and joins the thread. A second call while
    /// stopped is a no-op.
    pub fn stop(&self) {
        if self
            .core
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        debug!("worker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Surrenders the preimages recorded for `batch_id` under USE_UNDO.
    pub fn take_undo(&self, batch_id: u64) -> Option<Vec<(usize, u64)>> {
        self.core.undo.lock().unwrap().remove(&batch_id)
    }

    /// Reservation CASes lost so far. Misses are tolerated: the commit
    /// publishes the final word regardless.
    pub fn reserve_misses(&self) -> u64 {
        self.core.reserve_misses.load(Ordering::Relaxed)
    }

    pub fn batches_processed(&self) -> u64 {
        self.core.batches.load(Ordering::Relaxed)
    }
}

impl Drop for AsyncWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WorkerCore {
    fn run(&self) {
        let mut batch: Vec<Descriptor> = Vec::with_capacity(2 * DRAIN_MAX);
        while self.running.load(Ordering::Acquire) {
            batch.clear();
            if self.queue.drain_batch(&mut batch, DRAIN_MAX) == 0 {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }

            let bid = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
            for d in batch.iter_mut() {
                d.batch_id = bid;
            }

            // Stable sort: high-priority first, then by target so runs of
            // contiguous indices with one relation become single groups.
            batch.sort_by_key(|d| (!d.has_flag(flag::HIGH_PRIORITY), d.idx, d.rel, d.op));

            self.batches.fetch_add(1, Ordering::Relaxed);
            trace!(batch = bid, drained = batch.len(), "processing batch");

            let mut i = 0;
            while i < batch.len() {
                let mut j = i + 1;
                while j < batch.len()
                    && batch[j].idx == batch[j - 1].idx + 1
                    && batch[j].rel == batch[i].rel
                {
                    j += 1;
                }
                self.process_group(&batch[i..j]);
                i = j;
            }
        }
    }

    fn process_group(&self, group: &[Descriptor]) {
        let bid = group[0].batch_id;
        let clk_commit = ((bid << 1) & 0xFFFF) as u16;
        let clk_pending = clk_commit | 1;

        // Reservation pass. Failures are recorded, never fatal: the commit
        // below release-stores the final word either way, trading strict
        // isolation for forward progress.
        if group.iter().any(|d| d.has_flag(flag::RESERVE_BEFORE_COMPUTE)) {
            for d in group {
                let idx = d.idx as usize;
                let cur = self.fabric.load(idx);
                if !self.fabric.reserve(idx, cur, clk_pending, d.rel) {
                    self.reserve_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let mut commits: Vec<CommitEntry> = Vec::with_capacity(group.len());
        let mut undo: Vec<(usize, u64)> = Vec::new();

        let mut k = 0;
        while k < group.len() {
            let d = &group[k];
            let notify = !d.has_flag(flag::SKIP_NOTIFY);
            match d.op {
                op::APPLY_GRAD => {
                    let mut end = k + 1;
                    while end < group.len() && group[end].op == op::APPLY_GRAD {
                        end += 1;
                    }
                    self.apply_grad_run(&group[k..end], clk_commit, &mut commits, &mut undo);
                    k = end;
                    continue;
                }
                op::SET => {
                    let idx = d.idx as usize;
                    self.capture_undo(d, idx, &mut undo);
                    commits.push(CommitEntry {
                        idx,
                        word: self.set_word(d, clk_commit),
                        notify,
                    });
                }
                op::BATCH_SET => {
                    for t in 0..d.count as usize {
                        let idx = d.idx as usize + t;
                        self.capture_undo(d, idx, &mut undo);
                        commits.push(CommitEntry {
                            idx,
                            word: self.set_word(d, clk_commit),
                            notify,
                        });
                    }
                }
                op::ADD => {
                    let idx = d.idx as usize;
                    self.capture_undo(d, idx, &mut undo);
                    let sum = self.fabric.value32_at(idx).wrapping_add(d.arg as u32);
                    commits.push(CommitEntry {
                        idx,
                        word: self.value_word(sum, d, clk_commit),
                        notify,
                    });
                }
                op::EPOCH_BUMP => {
                    self.fabric.bump_region(d.arg as usize);
                }
                other => {
                    warn!(op = other, idx = d.idx, "dropping descriptor with unknown op");
                }
            }
            k += 1;
        }

        // A stamped clock that lapped the cell's current clock would
        // reorder effective timestamps; FORCE_EPOCH_BUMP descriptors ask
        // for the region bump that restores monotonicity.
        if self.fabric.mode() == PackedMode::Value32 {
            for d in group.iter().filter(|d| d.has_flag(flag::FORCE_EPOCH_BUMP)) {
                let idx = d.idx as usize;
                if clk_commit < self.fabric.clk16_at(idx) {
                    self.fabric.bump_region(self.fabric.region_of(idx));
                }
            }
        }

        self.fabric.commit_batch(&commits);

        if !undo.is_empty() {
            self.undo.lock().unwrap().entry(bid).or_default().extend(undo);
        }
    }

    /// Committed word for SET-family descriptors.
    fn set_word(&self, d: &Descriptor, clk: u16) -> u64 {
        match self.fabric.mode() {
            PackedMode::Value32 => {
                let st = if d.state_hint != 0 { d.state_hint } else { state::ST_PUBLISHED };
                packed::value32::pack(d.arg as u32, clk, st, d.rel)
            }
            // No in-word value in CLK48 mode: the argument is the packed
            // word itself.
            PackedMode::Clk48 => d.arg,
        }
    }

    fn value_word(&self, value: u32, d: &Descriptor, clk: u16) -> u64 {
        let st = if d.state_hint != 0 { d.state_hint } else { state::ST_PUBLISHED };
        match self.fabric.mode() {
            PackedMode::Value32 => packed::value32::pack(value, clk, st, d.rel),
            PackedMode::Clk48 => packed::clk48::pack(clk as u64, st, d.rel),
        }
    }

    #[inline]
    fn capture_undo(&self, d: &Descriptor, idx: usize, undo: &mut Vec<(usize, u64)>) {
        if d.has_flag(flag::USE_UNDO) {
            undo.push((idx, self.fabric.load(idx)));
        }
    }

    /// Gradient kernel over a coalesced APPLY_GRAD run. The group leader's
    /// `arg` points at the first lane; lanes are read as one contiguous
    /// slice, eight at a time through SIMD registers with a scalar tail.
    fn apply_grad_run(
        &self,
        run: &[Descriptor],
        clk: u16,
        commits: &mut Vec<CommitEntry>,
        undo: &mut Vec<(usize, u64)>,
    ) {
        let lead = &run[0];
        let base = lead.idx as usize;
        let rel = lead.rel;
        let st = if lead.state_hint != 0 { lead.state_hint } else { state::ST_COMPLETE };
        let notify = !lead.has_flag(flag::SKIP_NOTIFY);
        let grad = lead.arg as usize as *const i32;
        if grad.is_null() {
            warn!(idx = lead.idx, "APPLY_GRAD with null gradient pointer dropped");
            return;
        }
        let lanes = run.len();
        // SAFETY: the submitter guarantees the gradient buffer spans the
        // coalesced group and stays live until the batch is processed (the
        // `Descriptor::apply_grad` contract).
        let grads = unsafe { std::slice::from_raw_parts(grad, lanes) };

        for d in run {
            self.capture_undo(d, d.idx as usize, undo);
        }

        let mode = self.fabric.mode();
        let make = |v: i32, t: usize| CommitEntry {
            idx: base + t,
            word: match mode {
                PackedMode::Value32 => packed::value32::pack(v as u32, clk, st, rel),
                PackedMode::Clk48 => packed::clk48::pack(clk as u64, st, rel),
            },
            notify,
        };

        let mut t = 0;
        while t + 8 <= lanes {
            let mut arr = [0i32; 8];
            arr.copy_from_slice(&grads[t..t + 8]);
            let v = i32x8::from(arr);
            for (lane, &gv) in v.to_array().iter().enumerate() {
                commits.push(make(gv, t + lane));
            }
            t += 8;
        }
        while t < lanes {
            commits.push(make(grads[t], t));
            t += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_fabric::Layout;

    fn worker(n: usize) -> AsyncWorker {
        let fabric =
            Arc::new(CellFabric::new(n, PackedMode::Value32, Layout::Aos, None).unwrap());
        AsyncWorker::new(fabric, 64)
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let w = worker(8);
        assert!(!w.is_running());
        w.start();
        w.start();
        assert!(w.is_running());
        w.stop();
        w.stop();
        assert!(!w.is_running());
        w.start();
        assert!(w.is_running());
        w.stop();
    }

    #[test]
    fn submit_reports_mailbox_full() {
        let w = worker(8);
        // Worker not started: nothing drains.
        for i in 0..64u32 {
            assert!(w.submit(Descriptor::set(i % 8, 0, 0x01)));
        }
        assert!(!w.submit(Descriptor::set(0, 0, 0x01)));
        assert!(!w.submit_blocking(Descriptor::set(0, 0, 0x01), 10));
    }

    #[test]
    fn batch_clock_stamps_are_even() {
        for bid in [1u64, 2, 7, 0x8000, 0xFFFF] {
            let clk = ((bid << 1) & 0xFFFF) as u16;
            assert_eq!(clk & 1, 0);
        }
    }
}
