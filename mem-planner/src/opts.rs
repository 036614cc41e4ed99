use crate::{
    align::AlignCategory,
    error::{MemPlanError, MemPlanResult},
};
use serde::{Deserialize, Serialize};
use std::{env, str::FromStr};

const DEFAULT_COUNTER_THREADS: usize = 4;
const MAX_COUNTER_THREADS: usize = 64;
const MAX_PLANNER_THREADS: usize = 16;
const DEFAULT_SEGMENT_ROWS: u32 = 1 << 22;
const DEFAULT_ALIGN_ROWS: u32 = 1 << 21;
const DEFAULT_SLOT_BLOCKS: usize = 1 << 20;
const DEFAULT_MAX_CHUNKS: usize = 1 << 18;
const DEFAULT_MAX_SEGMENTS: usize = 1 << 16;

const TEST_COUNTER_THREADS: usize = 4;
const TEST_PLANNER_THREADS: usize = 2;
const TEST_SEGMENT_ROWS: u32 = 1 << 10;
const TEST_ALIGN_ROWS: u32 = 1 << 8;
const TEST_SLOT_BLOCKS: usize = 1 << 12;
const TEST_MAX_CHUNKS: usize = 1 << 8;
const TEST_MAX_SEGMENTS: usize = 1 << 10;

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key).map_or_else(|_| default, |s| s.parse::<T>().unwrap_or(default))
}

/// Options of the memory counting and planning pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemPlannerOpts {
    /// Number of address counters, one shard of the address space each. Power of two.
    pub counter_threads: usize,
    /// Number of RAM reconstruction workers.
    pub planner_threads: usize,
    /// Rows of one memory circuit instance.
    pub segment_rows: u32,
    /// Rows of one alignment circuit instance.
    pub align_rows: u32,
    /// Slot blocks pre-allocated by each address counter.
    pub slot_blocks: usize,
    /// Capacity of the chunk table.
    pub max_chunks: usize,
    /// Capacity of the RAM locator channel.
    pub max_segments: usize,
}

impl Default for MemPlannerOpts {
    fn default() -> Self {
        let planner_threads = num_cpus::get().clamp(1, MAX_PLANNER_THREADS);
        Self {
            counter_threads: env_or("MEM_COUNTER_THREADS", DEFAULT_COUNTER_THREADS),
            planner_threads: env_or("MEM_PLANNER_THREADS", planner_threads),
            segment_rows: env_or("MEM_SEGMENT_ROWS", DEFAULT_SEGMENT_ROWS),
            align_rows: env_or("MEM_ALIGN_ROWS", DEFAULT_ALIGN_ROWS),
            slot_blocks: env_or("MEM_SLOT_BLOCKS", DEFAULT_SLOT_BLOCKS),
            max_chunks: env_or("MEM_MAX_CHUNKS", DEFAULT_MAX_CHUNKS),
            max_segments: env_or("MEM_MAX_SEGMENTS", DEFAULT_MAX_SEGMENTS),
        }
    }
}

impl MemPlannerOpts {
    pub fn test_opts() -> Self {
        Self {
            counter_threads: TEST_COUNTER_THREADS,
            planner_threads: TEST_PLANNER_THREADS,
            segment_rows: TEST_SEGMENT_ROWS,
            align_rows: TEST_ALIGN_ROWS,
            slot_blocks: TEST_SLOT_BLOCKS,
            max_chunks: TEST_MAX_CHUNKS,
            max_segments: TEST_MAX_SEGMENTS,
        }
    }

    pub fn validate(&self) -> MemPlanResult<()> {
        if !self.counter_threads.is_power_of_two() || self.counter_threads > MAX_COUNTER_THREADS {
            return Err(MemPlanError::InvalidConfig(format!(
                "counter_threads must be a power of two up to {MAX_COUNTER_THREADS}, got {}",
                self.counter_threads
            )));
        }
        let max_align_op = AlignCategory::Full5.rows();
        if self.align_rows < max_align_op {
            return Err(MemPlanError::InvalidConfig(format!(
                "align_rows must hold a {max_align_op}-row operation, got {}",
                self.align_rows
            )));
        }
        for (name, value) in [
            ("planner_threads", self.planner_threads),
            ("segment_rows", self.segment_rows as usize),
            ("slot_blocks", self.slot_blocks),
            ("max_chunks", self.max_chunks),
            ("max_segments", self.max_segments),
        ] {
            if value == 0 {
                return Err(MemPlanError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}
