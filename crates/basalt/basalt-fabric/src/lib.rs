//! `basalt-fabric`: the lock-free shared-memory cell fabric.
//!
//! One array of authoritative 64-bit packed cells, NUMA-pinned and
//! page-aligned so a co-processor can map the same physical pages.
//! Producers and consumers coordinate through CAS transitions on each
//! cell's word; a lazy per-region epoch table extends the in-cell 16-bit
//! clock to a monotonic 64-bit effective timestamp without per-cell writes.
//!
//! # Core pieces
//!
//! - [`CellFabric`]: the array plus its state-machine operations
//! - [`EpochTable`]: per-region logical-clock extension
//! - [`RelIndex`]: best-effort per-region relation accumulation for scans
//! - [`WakeHub`]: block/wake on any cell-word change

mod epoch;
mod fabric;
mod relindex;
mod wake;

pub use epoch::{EpochCallback, EpochTable};
pub use fabric::{CellFabric, CommitEntry, FabricError, Layout, STREAM_COMMIT_THRESHOLD};
pub use relindex::RelIndex;
pub use wake::WakeHub;
