//! Alignment accounting for narrow and unaligned accesses.
//!
//! Every access other than an aligned 8-byte one is replayed by the alignment circuit, which
//! spends `1 + addr_count * ops_by_addr` rows on it. The counter splits the chunk-ordered
//! stream of those operations into circuit instances of a fixed row capacity.

use crate::{
    bus::AccessEvent,
    chunk::{Chunk, ChunkBuffer},
    error::{MemPlanError, MemPlanResult},
    observer::{MemObserver, MemWorker},
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use strum_macros::EnumIter;

pub const ALIGN_CATEGORIES: usize = 5;

/// Shapes of alignment operations, each with a fixed row cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, Serialize, Deserialize)]
pub enum AlignCategory {
    /// Crossing write.
    Full5,
    /// Crossing read or narrow write.
    Full3,
    /// Narrow read.
    Full2,
    ReadByte,
    WriteByte,
}

impl AlignCategory {
    #[inline(always)]
    pub const fn rows(self) -> u32 {
        match self {
            AlignCategory::Full5 => 5,
            AlignCategory::Full3 => 3,
            AlignCategory::Full2 => 2,
            AlignCategory::ReadByte => 2,
            AlignCategory::WriteByte => 3,
        }
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Category of an access, `None` for aligned 8-byte accesses which need no alignment work.
    pub fn of(event: &AccessEvent) -> MemPlanResult<Option<AlignCategory>> {
        if event.is_aligned() {
            return Ok(None);
        }
        let addr_count = if event.crosses_word() { 2 } else { 1 };
        let rows = 1 + addr_count * event.ops_by_addr();
        let category = match (event.width, rows) {
            (1, 2) => AlignCategory::ReadByte,
            (1, 3) => AlignCategory::WriteByte,
            (_, 2) => AlignCategory::Full2,
            (_, 3) => AlignCategory::Full3,
            (_, 5) => AlignCategory::Full5,
            _ => {
                return Err(MemPlanError::InvalidAlignOp {
                    addr: event.address,
                    rows,
                })
            }
        };
        Ok(Some(category))
    }
}

/// The alignment operations of one chunk that land in one alignment segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignCheckpoint {
    pub segment_id: u32,
    pub chunk_id: u32,
    /// Operations of the chunk placed in earlier segments.
    pub skip: u32,
    /// Operations of the chunk placed in this segment.
    pub count: u32,
    pub rows: u32,
    /// First row of the chunk inside the segment.
    pub offset: u32,
    pub op_counts: [u32; ALIGN_CATEGORIES],
}

/// Consumes the chunk stream on its own cursor and plans the alignment segments.
#[derive(Debug)]
pub struct MisalignmentCounter {
    rows: u32,
    segment_id: u32,
    rows_available: u32,
    checkpoints: Vec<AlignCheckpoint>,
    totals: Vec<(u32, [u32; ALIGN_CATEGORIES])>,
}

impl MisalignmentCounter {
    pub fn new(rows: u32) -> Self {
        Self {
            rows,
            segment_id: 0,
            rows_available: rows,
            checkpoints: vec![],
            totals: vec![],
        }
    }

    pub fn execute(&mut self, buffer: &ChunkBuffer, observer: &dyn MemObserver) -> MemPlanResult<()> {
        let mut index = 0;
        loop {
            let wait_start = Instant::now();
            let Some(chunk) = buffer.await_chunk(index) else {
                break;
            };
            let wait = wait_start.elapsed();

            let start = Instant::now();
            self.count_chunk(&chunk)?;
            observer.on_chunk(MemWorker::Align, chunk.id, wait, start.elapsed());
            index += 1;
        }
        debug!(
            "alignment counter: {} chunks, {} segments",
            self.totals.len(),
            self.segments()
        );
        Ok(())
    }

    pub fn count_chunk(&mut self, chunk: &Chunk) -> MemPlanResult<()> {
        let mut skip = 0;
        let mut totals = [0; ALIGN_CATEGORIES];
        let mut current: Option<AlignCheckpoint> = None;

        for data in chunk.data.iter() {
            let event = data.decode().map_err(|e| e.in_chunk(chunk.id))?;
            let Some(category) = AlignCategory::of(&event).map_err(|e| e.in_chunk(chunk.id))?
            else {
                continue;
            };
            let rows = category.rows();

            if rows > self.rows_available {
                if let Some(done) = current.take() {
                    skip = done.skip + done.count;
                    self.checkpoints.push(done);
                }
                self.segment_id += 1;
                self.rows_available = self.rows;
            }
            let checkpoint = current.get_or_insert_with(|| AlignCheckpoint {
                segment_id: self.segment_id,
                chunk_id: chunk.id,
                skip,
                offset: self.rows - self.rows_available,
                ..Default::default()
            });
            checkpoint.count += 1;
            checkpoint.rows += rows;
            checkpoint.op_counts[category.index()] += 1;
            totals[category.index()] += 1;
            self.rows_available -= rows;
        }

        if let Some(done) = current {
            self.checkpoints.push(done);
        }
        if totals.iter().any(|&n| n > 0) {
            self.totals.push((chunk.id, totals));
        }
        Ok(())
    }

    /// Checkpoints ordered by segment, then chunk.
    pub fn checkpoints(&self) -> &[AlignCheckpoint] {
        &self.checkpoints
    }

    /// Operations per category of every chunk that needed alignment work, in chunk order.
    pub fn totals(&self) -> &[(u32, [u32; ALIGN_CATEGORIES])] {
        &self.totals
    }

    pub fn segments(&self) -> usize {
        self.checkpoints
            .last()
            .map_or(0, |last| last.segment_id as usize + 1)
    }

    pub fn into_parts(self) -> (Vec<AlignCheckpoint>, Vec<(u32, [u32; ALIGN_CATEGORIES])>) {
        (self.checkpoints, self.totals)
    }
}
