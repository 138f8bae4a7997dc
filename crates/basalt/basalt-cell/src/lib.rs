//! `basalt-cell`: the packed 64-bit cell word and the worker descriptor.
//!
//! Everything here is pure data manipulation with no atomics and no
//! allocation; the shared-memory protocol built on top lives in
//! `basalt-fabric`.

mod descriptor;
pub mod packed;
pub mod state;

pub use descriptor::{Descriptor, flag, op};
pub use packed::{PackedMode, clk48, is_pending, rel_matches, state_rel, value32};
