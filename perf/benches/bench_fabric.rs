use basalt_cell::packed::{self, value32};
use basalt_cell::state::{ST_CLAIMED, ST_COMPLETE};
use basalt_fabric::Layout;
use basalt_perf::{bench_fabric, seed_relations};
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

fn bench_publish(c: &mut Criterion) {
    let f = bench_fabric(65536, Layout::Aos);

    let mut group = c.benchmark_group("fabric");
    group.throughput(Throughput::Elements(1));

    group.bench_function("publish", |b| {
        b.iter(|| f.publish(black_box(7), black_box(0xDEAD_BEEF), 0x01));
    });

    group.bench_function("load", |b| {
        b.iter(|| black_box(f.load(black_box(7))));
    });

    group.bench_function("effective_ts", |b| {
        f.init_epoch(1024).ok();
        b.iter(|| black_box(f.effective_ts(black_box(7))));
    });

    group.finish();
}

fn bench_claim_cycle(c: &mut Criterion) {
    let f = bench_fabric(1024, Layout::Aos);

    let mut group = c.benchmark_group("fabric");
    group.throughput(Throughput::Elements(1));

    group.bench_function("claim + complete", |b| {
        b.iter(|| {
            f.publish(3, 1, 0x02);
            let published = f.load(3);
            let claimed = packed::with_state(published, ST_CLAIMED);
            if f.try_claim(3, published, claimed) {
                let complete = value32::pack(
                    2,
                    value32::clk(claimed).wrapping_add(2),
                    ST_COMPLETE,
                    0x02,
                );
                f.mark_complete(3, complete);
            }
        });
    });

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let dense = bench_fabric(65536, Layout::Aos);
    seed_relations(&dense, 4, 0x04);

    let indexed = bench_fabric(65536, Layout::Aos);
    indexed.init_epoch(1024).expect("epoch init");
    // One relation run confined to a single region: the index skips the
    // other 63 regions.
    for i in 2048..2064 {
        indexed.publish(i, 0, 0x04);
    }

    let mut group = c.benchmark_group("scan");

    group.bench_function("dense (no index)", |b| {
        b.iter(|| black_box(dense.scan_relation(0x04)));
    });

    group.bench_function("sparse (region index)", |b| {
        b.iter(|| black_box(indexed.scan_relation(0x04)));
    });

    group.finish();
}

criterion_group!(benches, bench_publish, bench_claim_cycle, bench_scan);
criterion_main!(benches);
