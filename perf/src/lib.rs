use basalt_cell::{Descriptor, PackedMode};
use basalt_fabric::{CellFabric, Layout};
use std::sync::Arc;

// ─── Fixtures shared by the benches ─────────────────────────────────────

pub fn bench_fabric(n: usize, layout: Layout) -> Arc<CellFabric> {
    Arc::new(CellFabric::new(n, PackedMode::Value32, layout, None).expect("bench fabric"))
}

pub fn make_set_descriptor(i: u32) -> Descriptor {
    Descriptor::set(i, i as u64, 0x01)
}

/// Publishes `every`-spaced cells with `rel` so scans have runs to find.
pub fn seed_relations(fabric: &CellFabric, every: usize, rel: u8) {
    let mut i = 0;
    while i < fabric.len() {
        fabric.publish(i, i as u32, rel);
        i += every;
    }
}
