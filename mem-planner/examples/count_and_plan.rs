use log::info;
use pico_mem_planner::{
    bus::{load_chunk_file, MemBusData},
    layout::{INPUT_ADDR, RAM_ADDR, ROM_ADDR},
    observer::MemPerf,
    MemPipeline, MemPlannerOpts, MemRegion,
};
use std::{env, path::PathBuf, sync::Arc, time::Instant};
use strum::IntoEnumIterator;

const SYNTHETIC_CHUNKS: u32 = 64;
const SYNTHETIC_CHUNK_SIZE: u32 = 1 << 16;

/// Deterministic stand-in for an emulator trace: sequential code fetches, a small input read
/// and a stack-like RAM pattern with some narrow stores.
fn synthetic_chunk(id: u32) -> Vec<MemBusData> {
    (0..SYNTHETIC_CHUNK_SIZE)
        .map(|i| {
            let step = id * SYNTHETIC_CHUNK_SIZE + i;
            match i % 8 {
                0..=3 => MemBusData::read(ROM_ADDR + (step % 0x4000) * 8, 8),
                4 => MemBusData::read(INPUT_ADDR + (step % 512) * 8, 8),
                5 => MemBusData::write(RAM_ADDR + 0x10_0000 - (step % 4096) * 8, 8),
                6 => MemBusData::write(RAM_ADDR + (step % 1024) * 8 + 3, 1),
                _ => MemBusData::read(RAM_ADDR + (step.wrapping_mul(2654435761) % 0x8_0000) * 8, 8),
            }
        })
        .collect()
}

fn parse_args(args: Vec<String>) -> (Vec<PathBuf>, Option<String>) {
    let mut files = vec![];
    let mut perf_csv = None;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--perf" {
            perf_csv = args.next();
        } else {
            files.push(PathBuf::from(arg));
        }
    }
    (files, perf_csv)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let (files, perf_csv) = parse_args(env::args().collect());

    let opts = MemPlannerOpts::default();
    let perf = Arc::new(MemPerf::new());
    let mut pipeline = MemPipeline::with_observer(opts, perf.clone());
    pipeline.prepare()?;
    pipeline.execute()?;

    let start = Instant::now();
    if files.is_empty() {
        info!("no chunk files given, replaying {SYNTHETIC_CHUNKS} synthetic chunks");
        for id in 0..SYNTHETIC_CHUNKS {
            pipeline.add_chunk(synthetic_chunk(id))?;
        }
    } else {
        for file in files.iter() {
            pipeline.add_chunk(load_chunk_file(file)?)?;
        }
    }
    pipeline.mark_complete();

    if let Err(err) = pipeline.wait() {
        eprintln!("memory planning failed: {err}");
        std::process::exit(1);
    }
    info!("count and plan done in {:?}", start.elapsed());

    for region in MemRegion::iter() {
        let rows: u32 = pipeline.segments(region).iter().map(|s| s.rows()).sum();
        info!(
            "{region}: {} segments, {rows} rows",
            pipeline.segment_count(region)
        );
    }
    info!(
        "alignment: {} checkpoints",
        pipeline.alignment_checkpoints().len()
    );
    let mut stats: Vec<_> = pipeline.stats().into_iter().collect();
    stats.sort();
    for (key, value) in stats {
        info!("{key}: {value}");
    }

    match perf_csv {
        Some(path) => perf.save_to_csv(&path)?,
        None => {
            for (step, time_type, time) in perf.summary() {
                info!("{step} {time_type}: {time:?}");
            }
        }
    }
    Ok(())
}
