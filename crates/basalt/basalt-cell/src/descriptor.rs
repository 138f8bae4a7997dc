//! The compact work item producers hand to the async worker.
//!
//! A descriptor is fixed-size, `Copy`, heap-free, and travels through the
//! MPMC mailbox by value. Interpretation of `arg` depends on `op`.

/// Operation kinds. 0xF0 and above are free for user extension.
pub mod op {
    /// `arg` is the new packed word (low 32 bits are the value in VALUE32 mode).
    pub const SET: u8 = 1;
    /// Like SET applied to `count` consecutive cells starting at `idx`.
    pub const BATCH_SET: u8 = 2;
    /// Adds the low 32 bits of `arg` to the cell's current value, wrapping.
    pub const ADD: u8 = 3;
    /// `arg` is a pointer to a caller-owned `i32` gradient buffer, one lane
    /// per descriptor in the coalesced group.
    pub const APPLY_GRAD: u8 = 4;
    /// `arg` is the region index whose epoch should be bumped.
    pub const EPOCH_BUMP: u8 = 5;
}

/// `op_flags` bits. They compose freely.
pub mod flag {
    /// Worker attempts a PENDING reservation on each target before computing.
    pub const RESERVE_BEFORE_COMPUTE: u8 = 0x01;
    /// Sorted ahead of normal descriptors within a drained batch.
    pub const HIGH_PRIORITY: u8 = 0x02;
    /// Worker records the preimage word of each target before committing.
    pub const USE_UNDO: u8 = 0x04;
    /// Suppress the waiter notification for this descriptor's commits.
    pub const SKIP_NOTIFY: u8 = 0x08;
    /// Bump the target's region epoch if the commit's clock stamp wrapped.
    pub const FORCE_EPOCH_BUMP: u8 = 0x10;
}

/// A work item. 40 bytes, `repr(C)`, stable field order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub op: u8,
    pub op_flags: u8,
    /// Optional hint for the committed state tag; 0 lets the worker choose.
    pub state_hint: u8,
    /// Relation mask stamped into commits and used for coalescing.
    pub rel: u8,
    /// Base cell index.
    pub idx: u32,
    /// Element count for batch operations; 1 otherwise.
    pub count: u32,
    /// Assigned by the worker when the batch is drained; 0 on submission.
    pub batch_id: u64,
    /// Opaque undo correlation hint, surrendered with the undo record.
    pub undo_hint: u64,
    /// Per-op argument: immediate word, pointer, or region index.
    pub arg: u64,
}

impl Descriptor {
    /// SET: publish `word`'s low bits as the cell's new value.
    pub fn set(idx: u32, word: u64, rel: u8) -> Self {
        Self {
            op: op::SET,
            rel,
            idx,
            count: 1,
            arg: word,
            ..Self::default()
        }
    }

    /// BATCH_SET: publish the same value into `count` consecutive cells.
    pub fn batch_set(idx: u32, count: u32, word: u64, rel: u8) -> Self {
        Self {
            op: op::BATCH_SET,
            rel,
            idx,
            count,
            arg: word,
            ..Self::default()
        }
    }

    /// ADD: wrapping-add `delta` to the cell's current 32-bit value.
    pub fn add(idx: u32, delta: u32, rel: u8) -> Self {
        Self {
            op: op::ADD,
            rel,
            idx,
            count: 1,
            arg: delta as u64,
            ..Self::default()
        }
    }

    /// APPLY_GRAD: one descriptor per target cell; `grads` points at this
    /// descriptor's own lane. When descriptors coalesce into a contiguous
    /// group, the worker reads the group's lanes as one slice starting at
    /// the group leader's pointer, so submitters must hand each descriptor
    /// `base.add(k)` for the k-th cell of a shared buffer.
    ///
    /// # Safety
    ///
    /// The buffer behind `grads` must cover every lane of any group this
    /// descriptor can coalesce into, and must stay live and unmodified
    /// until the worker has processed the batch. The worker dereferences
    /// this pointer with no further checks; a dangling pointer is undefined
    /// behavior.
    pub unsafe fn apply_grad(idx: u32, count: u32, grads: *const i32, rel: u8) -> Self {
        Self {
            op: op::APPLY_GRAD,
            rel,
            idx,
            count,
            arg: grads as usize as u64,
            ..Self::default()
        }
    }

    /// EPOCH_BUMP: ask the worker to bump `region`'s epoch counter.
    pub fn epoch_bump(region: u32) -> Self {
        Self {
            op: op::EPOCH_BUMP,
            count: 1,
            arg: region as u64,
            ..Self::default()
        }
    }

    /// Adds flag bits to the descriptor.
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.op_flags |= flags;
        self
    }

    /// Overrides the committed state tag.
    pub fn with_state_hint(mut self, st: u8) -> Self {
        self.state_hint = st;
        self
    }

    /// Attaches an undo correlation hint.
    pub fn with_undo_hint(mut self, hint: u64) -> Self {
        self.undo_hint = hint;
        self
    }

    #[inline(always)]
    pub fn has_flag(&self, f: u8) -> bool {
        self.op_flags & f != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    /// The descriptor crosses the mailbox by value and its wire size is part
    /// of the external interface: 40 bytes, 8-byte aligned.
    #[test]
    fn descriptor_is_40_bytes() {
        assert_eq!(size_of::<Descriptor>(), 40, "Descriptor layout changed");
        assert_eq!(align_of::<Descriptor>(), 8);
    }

    #[test]
    fn flags_compose() {
        let d = Descriptor::set(3, 0x55, 0x01)
            .with_flags(flag::RESERVE_BEFORE_COMPUTE)
            .with_flags(flag::USE_UNDO | flag::SKIP_NOTIFY);
        assert!(d.has_flag(flag::RESERVE_BEFORE_COMPUTE));
        assert!(d.has_flag(flag::USE_UNDO));
        assert!(d.has_flag(flag::SKIP_NOTIFY));
        assert!(!d.has_flag(flag::HIGH_PRIORITY));
    }

    #[test]
    fn constructors_fill_the_expected_fields() {
        let d = Descriptor::batch_set(10, 4, 0x1234, 0x08);
        assert_eq!(d.op, op::BATCH_SET);
        assert_eq!((d.idx, d.count, d.arg, d.rel), (10, 4, 0x1234, 0x08));
        assert_eq!(d.batch_id, 0);

        let e = Descriptor::epoch_bump(7);
        assert_eq!(e.op, op::EPOCH_BUMP);
        assert_eq!(e.arg, 7);
    }
}
