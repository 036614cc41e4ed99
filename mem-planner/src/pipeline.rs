//! Drives the count and plan phases and exposes the producer and consumer side of the planner.
//!
//! ```text
//! emulator -> ChunkBuffer -> AddressCounter x T ----> ImmutablePlanner (rom, input)
//!                        \-> MisalignmentCounter  \-> RamPlanner discovery -> LocatorChannel
//!                                                                         -> workers x P
//! ```
//!
//! The first fatal error of any thread completes the chunk stream and the locator channel so
//! that no other thread stays blocked, and is returned by [`MemPipeline::wait`]. A failed run
//! yields no segments.

use crate::{
    align::{AlignCheckpoint, MisalignmentCounter, ALIGN_CATEGORIES},
    bus::MemBusData,
    chunk::ChunkBuffer,
    counter::AddressCounter,
    error::{MemPlanError, MemPlanResult},
    layout::{MemRegion, ShardLayout},
    observer::{MemObserver, MemPhase, NoopObserver},
    opts::MemPlannerOpts,
    plan::{join_worker, ImmutablePlanner, LocatorChannel, RamPlanner},
    segment::{Checkpoint, Segment, SegmentCollection},
};
use hashbrown::HashMap;
use log::info;
use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Instant,
};
use strum::IntoEnumIterator;
use tracing::debug_span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    Preparing,
    Counting,
    Planning,
    Done,
}

impl PipelineState {
    pub const fn name(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Preparing => "preparing",
            PipelineState::Counting => "counting",
            PipelineState::Planning => "planning",
            PipelineState::Done => "done",
        }
    }
}

/// Everything produced by a successful run.
#[derive(Debug, Default)]
pub struct MemPlan {
    segments: [Vec<Segment>; 3],
    align_checkpoints: Vec<AlignCheckpoint>,
    align_totals: Vec<(u32, [u32; ALIGN_CATEGORIES])>,
    stats: HashMap<String, usize>,
}

/// Publishing side of the pipeline, usable from the emulator thread.
#[derive(Clone)]
pub struct MemProducer {
    buffer: Arc<ChunkBuffer>,
}

impl MemProducer {
    pub fn add_chunk(&self, data: Vec<MemBusData>) -> MemPlanResult<u32> {
        self.buffer.add(data)
    }

    pub fn mark_complete(&self) {
        self.buffer.mark_complete();
    }
}

struct Counters {
    address: Vec<AddressCounter>,
    align: MisalignmentCounter,
}

pub struct MemPipeline {
    opts: MemPlannerOpts,
    observer: Arc<dyn MemObserver>,
    buffer: Arc<ChunkBuffer>,
    state: Arc<Mutex<PipelineState>>,
    counters: Option<Counters>,
    handle: Option<JoinHandle<MemPlanResult<MemPlan>>>,
    plan: Option<MemPlan>,
}

impl MemPipeline {
    pub fn new(opts: MemPlannerOpts) -> Self {
        Self::with_observer(opts, Arc::new(NoopObserver))
    }

    pub fn with_observer(opts: MemPlannerOpts, observer: Arc<dyn MemObserver>) -> Self {
        Self {
            buffer: Arc::new(ChunkBuffer::new(opts.max_chunks)),
            opts,
            observer,
            state: Arc::new(Mutex::new(PipelineState::Idle)),
            counters: None,
            handle: None,
            plan: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, from: PipelineState, to: PipelineState) -> MemPlanResult<()> {
        set_state(&self.state, from, to)
    }

    /// Allocates the counters. Chunks may be published from now on.
    pub fn prepare(&mut self) -> MemPlanResult<()> {
        self.opts.validate()?;
        self.transition(PipelineState::Idle, PipelineState::Preparing)?;

        let layout = ShardLayout::new(self.opts.counter_threads);
        self.counters = Some(Counters {
            address: (0..self.opts.counter_threads)
                .map(|shard| AddressCounter::new(shard, layout, self.opts.slot_blocks))
                .collect(),
            align: MisalignmentCounter::new(self.opts.align_rows),
        });
        info!(
            "mem planner prepared: {} counters, {} planners, {} rows per segment",
            self.opts.counter_threads, self.opts.planner_threads, self.opts.segment_rows
        );
        Ok(())
    }

    /// Starts counting in the background and returns immediately.
    pub fn execute(&mut self) -> MemPlanResult<()> {
        self.transition(PipelineState::Preparing, PipelineState::Counting)?;
        let counters = self.counters.take().ok_or(MemPlanError::InvalidState {
            expected: "prepared counters",
            found: "no counters",
        })?;

        let opts = self.opts;
        let buffer = self.buffer.clone();
        let state = self.state.clone();
        let observer = self.observer.clone();
        let handle = thread::Builder::new()
            .name("MemPlanner".to_string())
            .spawn(move || run(opts, counters, &buffer, &state, observer.as_ref()))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn check_open(&self) -> MemPlanResult<()> {
        match self.state() {
            PipelineState::Preparing | PipelineState::Counting => Ok(()),
            state => Err(MemPlanError::InvalidState {
                expected: "preparing or counting",
                found: state.name(),
            }),
        }
    }

    /// Publishes the next chunk and returns its id.
    pub fn add_chunk(&self, data: Vec<MemBusData>) -> MemPlanResult<u32> {
        self.check_open()?;
        self.buffer.add(data)
    }

    /// No more chunks will be published.
    pub fn mark_complete(&self) {
        self.buffer.mark_complete();
    }

    /// Handle publishing into this pipeline from another thread.
    pub fn producer(&self) -> MemPlanResult<MemProducer> {
        self.check_open()?;
        Ok(MemProducer {
            buffer: self.buffer.clone(),
        })
    }

    /// Blocks until both phases are done.
    pub fn wait(&mut self) -> MemPlanResult<()> {
        let handle = self.handle.take().ok_or(MemPlanError::InvalidState {
            expected: "running pipeline",
            found: self.state().name(),
        })?;
        let result = handle
            .join()
            .map_err(|_| MemPlanError::WorkerPanicked("MemPlanner".to_string()))
            .and_then(|result| result);
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = PipelineState::Done;

        let plan = result?;
        self.plan = Some(plan);
        Ok(())
    }

    fn plan(&self) -> Option<&MemPlan> {
        self.plan.as_ref()
    }

    pub fn segments(&self, region: MemRegion) -> &[Segment] {
        self.plan()
            .map(|plan| plan.segments[region.index()].as_slice())
            .unwrap_or_default()
    }

    pub fn segment_count(&self, region: MemRegion) -> u32 {
        self.segments(region).len() as u32
    }

    pub fn segment(&self, region: MemRegion, segment_id: u32) -> Option<&Segment> {
        self.segments(region).get(segment_id as usize)
    }

    /// Checkpoints of a segment in chunk order.
    pub fn segment_checkpoints(&self, region: MemRegion, segment_id: u32) -> Option<Vec<Checkpoint>> {
        self.segment(region, segment_id)
            .map(|segment| segment.checkpoints().copied().collect())
    }

    pub fn alignment_checkpoints(&self) -> &[AlignCheckpoint] {
        self.plan()
            .map(|plan| plan.align_checkpoints.as_slice())
            .unwrap_or_default()
    }

    /// Alignment operations per category of each chunk.
    pub fn alignment_totals(&self) -> &[(u32, [u32; ALIGN_CATEGORIES])] {
        self.plan()
            .map(|plan| plan.align_totals.as_slice())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> HashMap<String, usize> {
        self.plan().map(|plan| plan.stats.clone()).unwrap_or_default()
    }

    /// Releases the results and the chunks once the witness layer consumed them.
    pub fn clear(&mut self) {
        self.plan = None;
        self.buffer.clear();
    }
}

fn set_state(
    state: &Mutex<PipelineState>,
    from: PipelineState,
    to: PipelineState,
) -> MemPlanResult<()> {
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    if *state != from {
        return Err(MemPlanError::InvalidState {
            expected: from.name(),
            found: state.name(),
        });
    }
    *state = to;
    Ok(())
}

fn run(
    opts: MemPlannerOpts,
    counters: Counters,
    buffer: &ChunkBuffer,
    state: &Mutex<PipelineState>,
    observer: &dyn MemObserver,
) -> MemPlanResult<MemPlan> {
    let start = Instant::now();
    let counters = debug_span!("count phase").in_scope(|| count_phase(counters, buffer, observer))?;
    observer.on_phase(MemPhase::Count, start.elapsed());
    info!(
        "mem count phase: {} chunks, {} addresses in {:?}",
        buffer.len(),
        counters.address.iter().map(AddressCounter::addresses).sum::<usize>(),
        start.elapsed()
    );

    set_state(state, PipelineState::Counting, PipelineState::Planning)?;
    let start = Instant::now();
    let segments = debug_span!("plan phase").in_scope(|| plan_phase(&opts, &counters.address, observer))?;
    observer.on_phase(MemPhase::Plan, start.elapsed());
    info!(
        "mem plan phase: {} rom, {} input, {} ram segments in {:?}",
        segments[0].len(),
        segments[1].len(),
        segments[2].len(),
        start.elapsed()
    );

    let mut stats = HashMap::new();
    stats.insert("chunks".to_string(), buffer.len());
    stats.insert("events".to_string(), buffer.events());
    let sum = |f: fn(&AddressCounter) -> usize| counters.address.iter().map(f).sum::<usize>();
    stats.insert("addresses".to_string(), sum(AddressCounter::addresses));
    stats.insert("credits".to_string(), sum(AddressCounter::credits));
    stats.insert("slot_blocks".to_string(), sum(|c| c.arena().used_blocks()));
    for region in MemRegion::iter() {
        stats.insert(format!("{region}_segments"), segments[region.index()].len());
    }
    stats.insert("align_segments".to_string(), counters.align.segments());

    let (align_checkpoints, align_totals) = counters.align.into_parts();
    Ok(MemPlan {
        segments,
        align_checkpoints,
        align_totals,
        stats,
    })
}

/// Runs every counter over the chunk stream until the producer completes it.
fn count_phase(
    counters: Counters,
    buffer: &ChunkBuffer,
    observer: &dyn MemObserver,
) -> MemPlanResult<Counters> {
    let Counters { address, mut align } = counters;
    thread::scope(|s| -> MemPlanResult<Counters> {
        let spawn_err = |err| {
            buffer.mark_complete();
            MemPlanError::Io(err)
        };
        let handles = address
            .into_iter()
            .map(|mut counter| {
                thread::Builder::new()
                    .name(format!("MemCounter{}", counter.shard()))
                    .spawn_scoped(s, move || {
                        let result = counter.execute(buffer, observer);
                        if result.is_err() {
                            buffer.mark_complete();
                        }
                        result.map(|_| counter)
                    })
                    .map_err(spawn_err)
            })
            .collect::<Vec<_>>();
        let align_handle = thread::Builder::new()
            .name("MemAlignCounter".to_string())
            .spawn_scoped(s, move || {
                let result = align.execute(buffer, observer);
                if result.is_err() {
                    buffer.mark_complete();
                }
                result.map(|_| align)
            })
            .map_err(spawn_err);

        // join everything before reporting the first error
        let address = handles
            .into_iter()
            .enumerate()
            .map(|(i, handle)| handle.and_then(|h| join_worker(h, format!("address counter {i}"))))
            .collect::<Vec<_>>();
        let align = align_handle.and_then(|h| join_worker(h, "alignment counter"));
        Ok(Counters {
            address: address.into_iter().collect::<MemPlanResult<_>>()?,
            align: align?,
        })
    })
}

/// Plans the three regions. RAM discovery, the immutable planners and the RAM workers run
/// concurrently.
fn plan_phase(
    opts: &MemPlannerOpts,
    counters: &[AddressCounter],
    observer: &dyn MemObserver,
) -> MemPlanResult<[Vec<Segment>; 3]> {
    let channel = LocatorChannel::new(opts.max_segments);
    let collection = SegmentCollection::new();
    let ram = RamPlanner::new(opts.segment_rows, counters, observer);

    let (rom, input) = thread::scope(|s| -> MemPlanResult<_> {
        let discovery = s.spawn(|| {
            let start = Instant::now();
            let result = {
                let _complete = channel.completion_guard();
                ram.discover(&channel)
            };
            observer.on_phase(MemPhase::Discover, start.elapsed());
            result
        });
        let immutable = [MemRegion::Rom, MemRegion::Input].map(|region| {
            let planner = ImmutablePlanner::new(region, opts.segment_rows, counters, observer);
            s.spawn(move || planner.plan())
        });
        let workers: Vec<_> = (0..opts.planner_threads)
            .map(|_| s.spawn(|| ram.run_worker(&channel, &collection)))
            .collect();

        let discovered = join_worker(discovery, "ram discovery");
        let [rom, input] = immutable;
        let rom = join_worker(rom, "rom planner");
        let input = join_worker(input, "input planner");
        let built = workers
            .into_iter()
            .enumerate()
            .map(|(i, handle)| join_worker(handle, format!("ram planner {i}")))
            .collect::<MemPlanResult<Vec<_>>>();

        let discovered = discovered?;
        let built: usize = built?.into_iter().sum();
        if discovered != built {
            return Err(MemPlanError::InvalidState {
                expected: "one ram segment per locator",
                found: "missing ram segments",
            });
        }
        Ok((rom?, input?))
    })?;

    Ok([rom, input, collection.into_segments()])
}
