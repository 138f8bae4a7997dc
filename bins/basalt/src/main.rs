use basalt_cell::packed::{self, PackedMode, value32};
use basalt_cell::state::{ST_CLAIMED, ST_COMPLETE};
use basalt_cell::{Descriptor, state};
use basalt_config::{BasaltConfig, ConfigError};
use basalt_fabric::{CellFabric, FabricError, Layout};
use basalt_numa::AllocError;
use basalt_worker::AsyncWorker;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_ALLOC: i32 = 2;
const EXIT_INVALID_ARG: i32 = 3;
const EXIT_NUMA: i32 = 4;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let config = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let mode = match config.mode.as_str() {
        "value32" => PackedMode::Value32,
        "clk48" => PackedMode::Clk48,
        other => {
            error!("unknown mode '{other}' (expected value32 or clk48)");
            return EXIT_INVALID_ARG;
        }
    };
    let layout = match config.layout.as_str() {
        "aos" => Layout::Aos,
        "soa" => Layout::Soa,
        other => {
            error!("unknown layout '{other}' (expected aos or soa)");
            return EXIT_INVALID_ARG;
        }
    };

    let fabric = match CellFabric::new(config.cells, mode, layout, config.numa_node) {
        Ok(f) => Arc::new(f),
        Err(e) => {
            error!("fabric init failed: {e}");
            return match e {
                FabricError::Alloc(AllocError::NumaUnavailable)
                | FabricError::Alloc(AllocError::NumaUnsupported)
                | FabricError::Alloc(AllocError::InvalidNode { .. }) => EXIT_NUMA,
                FabricError::Alloc(_) => EXIT_ALLOC,
                _ => EXIT_INVALID_ARG,
            };
        }
    };
    if let Err(e) = fabric.init_epoch(config.region_size) {
        error!("epoch init failed: {e}");
        return EXIT_INVALID_ARG;
    }

    info!(
        cells = config.cells,
        mode = %config.mode,
        layout = %config.layout,
        node = ?config.numa_node,
        ptr = ?fabric.raw_ptr(),
        "BASALT: fabric ready (shared-mappable, page-aligned)"
    );

    let worker = AsyncWorker::new(Arc::clone(&fabric), config.queue_capacity);
    worker.start();

    // Demo traffic: the worker publishes a strip of cells, a consumer
    // claims one and completes it in place.
    for i in 0..16u32 {
        if !worker.submit_blocking(Descriptor::set(i, (1000 + i) as u64, 0x02), 1_000) {
            error!("mailbox refused demo descriptor {i}");
            worker.stop();
            return EXIT_FAILURE;
        }
    }
    let expected = fabric.load(15);
    if packed::state(expected) != state::ST_PUBLISHED
        && !fabric.wait_for_change(15, expected, 2_000)
    {
        error!("worker never committed the demo strip");
        worker.stop();
        return EXIT_FAILURE;
    }

    let runs = fabric.scan_relation(0x02);
    info!(?runs, "relation scan");

    let published = fabric.load(3);
    let claimed = packed::with_state(published, ST_CLAIMED);
    if fabric.try_claim(3, published, claimed) {
        let complete = match mode {
            PackedMode::Value32 => value32::pack(
                value32::value(claimed).wrapping_mul(2),
                value32::clk(claimed).wrapping_add(2),
                ST_COMPLETE,
                0x02,
            ),
            PackedMode::Clk48 => packed::with_state(claimed, ST_COMPLETE),
        };
        fabric.mark_complete(3, complete);
        info!(ts = fabric.effective_ts(3), "claimed and completed cell 3");
    }

    info!("\n{}", fabric.dump_range(0, 8));

    worker.stop();
    EXIT_OK
}

fn load_config() -> Result<BasaltConfig, i32> {
    match std::env::args().nth(1) {
        Some(path) => BasaltConfig::load(path).map_err(|e| {
            eprintln!("config error: {e}");
            match e {
                ConfigError::Read { .. } | ConfigError::Parse(_) => EXIT_INVALID_ARG,
            }
        }),
        // No config argument: run the demo on defaults.
        None => Ok(BasaltConfig::default()),
    }
}
