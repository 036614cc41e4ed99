//! Optional instrumentation of the pipeline.
//!
//! Components receive a [`MemObserver`] at construction and report timings through it. The
//! default [`NoopObserver`] discards everything; [`MemPerf`] keeps the entries in a lock-free
//! queue and can dump them as CSV.

use crate::layout::MemRegion;
use anyhow::{anyhow, Result};
use crossbeam::queue::SegQueue;
use csv::Writer;
use itertools::Itertools;
use std::{fmt, time::Duration};

/// Phases of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemPhase {
    Count,
    Discover,
    Plan,
}

impl fmt::Display for MemPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemPhase::Count => "count",
            MemPhase::Discover => "discover",
            MemPhase::Plan => "plan",
        };
        f.write_str(name)
    }
}

/// Consumers of the chunk stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemWorker {
    Counter(usize),
    Align,
}

impl fmt::Display for MemWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemWorker::Counter(shard) => write!(f, "counter_{shard}"),
            MemWorker::Align => f.write_str("align"),
        }
    }
}

pub trait MemObserver: Send + Sync {
    fn on_phase(&self, _phase: MemPhase, _elapsed: Duration) {}

    /// `wait` is the time spent blocked on the chunk buffer before `chunk_id` was available.
    fn on_chunk(&self, _worker: MemWorker, _chunk_id: u32, _wait: Duration, _elapsed: Duration) {}

    fn on_segment(&self, _region: MemRegion, _segment_id: u32, _rows: u32, _elapsed: Duration) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl MemObserver for NoopObserver {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemPerfEntry {
    pub step: String,
    pub target: String,
    pub id: Option<u32>,
    pub time_type: &'static str,
    pub time: Duration,
}

/// Collects every observation.
#[derive(Debug, Default)]
pub struct MemPerf {
    entries: SegQueue<MemPerfEntry>,
}

impl MemPerf {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(
        &self,
        step: impl ToString,
        target: impl ToString,
        id: Option<u32>,
        time_type: &'static str,
        time: Duration,
    ) {
        self.entries.push(MemPerfEntry {
            step: step.to_string(),
            target: target.to_string(),
            id,
            time_type,
            time,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns the collected entries.
    pub fn drain(&self) -> Vec<MemPerfEntry> {
        let mut entries = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop() {
            entries.push(entry);
        }
        entries
    }

    /// Total time per `(step, time_type)`, sorted by step.
    pub fn summary(&self) -> Vec<(String, &'static str, Duration)> {
        self.drain()
            .into_iter()
            .into_group_map_by(|entry| (entry.step.clone(), entry.time_type))
            .into_iter()
            .map(|((step, time_type), entries)| {
                (step, time_type, entries.iter().map(|e| e.time).sum::<Duration>())
            })
            .sorted_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)))
            .collect()
    }

    pub fn save_to_csv(&self, file_path: &str) -> Result<()> {
        let mut writer = Writer::from_path(file_path).map_err(|err| anyhow!(err.to_string()))?;
        writer
            .write_record(["Step", "Target", "Id", "Time Type", "Time (us)"])
            .map_err(|err| anyhow!(err.to_string()))?;
        self.drain()
            .iter()
            .try_for_each(|entry| {
                writer.write_record([
                    entry.step.clone(),
                    entry.target.clone(),
                    entry.id.map(|id| id.to_string()).unwrap_or_default(),
                    entry.time_type.to_string(),
                    entry.time.as_micros().to_string(),
                ])
            })
            .map_err(|err| anyhow!(err.to_string()))?;
        writer.flush().map_err(|err| anyhow!(err.to_string()))?;

        Ok(())
    }
}

impl MemObserver for MemPerf {
    fn on_phase(&self, phase: MemPhase, elapsed: Duration) {
        self.push(phase, "pipeline", None, "elapsed", elapsed);
    }

    fn on_chunk(&self, worker: MemWorker, chunk_id: u32, wait: Duration, elapsed: Duration) {
        self.push("count", worker, Some(chunk_id), "wait", wait);
        self.push("count", worker, Some(chunk_id), "elapsed", elapsed);
    }

    fn on_segment(&self, region: MemRegion, segment_id: u32, _rows: u32, elapsed: Duration) {
        self.push("plan", region, Some(segment_id), "elapsed", elapsed);
    }
}
