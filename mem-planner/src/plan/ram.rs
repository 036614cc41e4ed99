use super::{
    join_worker,
    locator::{Locator, LocatorChannel},
};
use crate::{
    arena::ChainEntry,
    counter::AddressCounter,
    error::{MemPlanError, MemPlanResult},
    layout::{MemRegion, ShardLayout},
    observer::MemObserver,
    segment::{Segment, SegmentBuilder, SegmentCollection},
    walker::TallyWalker,
};
use log::debug;
use std::{thread, time::Instant};

/// Plans the RAM region.
///
/// The parallel policy splits planning into a discovery pass, which only counts rows and
/// publishes a [`Locator`] whenever a segment fills up, and reconstruction workers that each
/// build one segment starting at a claimed locator. Both policies produce the same segments.
pub struct RamPlanner<'a> {
    rows: u32,
    counters: &'a [AddressCounter],
    layout: ShardLayout,
    observer: &'a dyn MemObserver,
}

impl<'a> RamPlanner<'a> {
    pub fn new(rows: u32, counters: &'a [AddressCounter], observer: &'a dyn MemObserver) -> Self {
        Self {
            rows,
            counters,
            layout: ShardLayout::new(counters.len()),
            observer,
        }
    }

    fn walker(&self) -> TallyWalker<'a> {
        TallyWalker::new(self.counters, MemRegion::Ram)
    }

    /// Builds every segment in a single pass.
    pub fn plan_sequential(&self) -> MemPlanResult<Vec<Segment>> {
        let mut builder = SegmentBuilder::new(MemRegion::Ram, self.rows, self.observer);
        for run in self.walker() {
            for (_, entry) in run.entries() {
                builder.add_rows(entry.chunk_id, run.addr, entry.count)?;
            }
        }
        Ok(builder.finish())
    }

    /// Walks the region counting rows and publishes the start of every segment.
    ///
    /// Returns the number of locators published. The channel is not marked complete here.
    pub fn discover(&self, channel: &LocatorChannel) -> MemPlanResult<usize> {
        let mut rows_available = 0u32;
        let mut reference: Option<Locator> = None;
        let mut published = 0;

        for run in self.walker() {
            let offset = run.offset();
            // the whole address fits, no need to visit its chain
            if run.chain.total <= rows_available {
                rows_available -= run.chain.total;
                let (pos, entry) = run.tail();
                reference = Some(Locator {
                    shard: run.shard,
                    offset,
                    pos,
                    skip: entry.count,
                });
                continue;
            }
            for (pos, entry) in run.entries() {
                let mut skip = 0;
                while skip < entry.count {
                    if rows_available == 0 {
                        let start = reference.unwrap_or(Locator {
                            shard: run.shard,
                            offset,
                            pos,
                            skip: 0,
                        });
                        channel.publish(start)?;
                        published += 1;
                        rows_available = self.rows;
                    }
                    let take = (entry.count - skip).min(rows_available);
                    skip += take;
                    rows_available -= take;
                    reference = Some(Locator {
                        shard: run.shard,
                        offset,
                        pos,
                        skip,
                    });
                }
            }
        }
        debug!("ram discovery: {published} segments");
        Ok(published)
    }

    /// Builds the segment starting at `locator`, stopping once it is full.
    pub fn reconstruct(&self, segment_id: u32, locator: &Locator) -> MemPlanResult<Segment> {
        let start = Instant::now();
        let mut walker = TallyWalker::resume(
            self.counters,
            MemRegion::Ram,
            self.layout,
            locator.shard,
            locator.offset,
        );
        let run = walker.next().ok_or(MemPlanError::InvalidState {
            expected: "locator on a touched address",
            found: "end of region",
        })?;
        let mut entries = run.entries_from(locator.pos);
        let (_, first) = entries.next().ok_or(MemPlanError::InvalidState {
            expected: "locator on a chain entry",
            found: "end of chain",
        })?;

        let mut segment = Segment::new(segment_id);
        let mut rows_available = self.rows;
        segment.add_rows(first.chunk_id, run.addr, locator.skip, 0);
        let take = (first.count - locator.skip).min(rows_available);
        if take > 0 {
            segment.add_rows(first.chunk_id, run.addr, locator.skip, take);
            rows_available -= take;
        }

        let fill = |segment: &mut Segment, rows_available: &mut u32, addr: u32, entry: ChainEntry| {
            let take = entry.count.min(*rows_available);
            segment.add_rows(entry.chunk_id, addr, 0, take);
            *rows_available -= take;
        };
        if rows_available > 0 {
            'walk: {
                for (_, entry) in entries {
                    fill(&mut segment, &mut rows_available, run.addr, entry);
                    if rows_available == 0 {
                        break 'walk;
                    }
                }
                for run in walker {
                    for (_, entry) in run.entries() {
                        fill(&mut segment, &mut rows_available, run.addr, entry);
                        if rows_available == 0 {
                            break 'walk;
                        }
                    }
                }
            }
        }

        debug!(
            "ram segment {segment_id}: {} rows, {} chunks",
            segment.rows(),
            segment.chunks()
        );
        self.observer
            .on_segment(MemRegion::Ram, segment_id, segment.rows(), start.elapsed());
        Ok(segment)
    }

    /// Claims locators until the channel is drained, moving each segment into `collection`.
    pub fn run_worker(
        &self,
        channel: &LocatorChannel,
        collection: &SegmentCollection,
    ) -> MemPlanResult<usize> {
        let mut built = 0;
        while let Some((segment_id, locator)) = channel.claim_next() {
            let segment = self.reconstruct(segment_id, &locator)?;
            collection.insert(segment);
            built += 1;
        }
        Ok(built)
    }

    /// Runs discovery and `workers` reconstruction workers concurrently.
    pub fn plan_parallel(&self, workers: usize, max_segments: usize) -> MemPlanResult<Vec<Segment>> {
        let channel = LocatorChannel::new(max_segments);
        let collection = SegmentCollection::new();

        thread::scope(|s| -> MemPlanResult<()> {
            let discovery = s.spawn(|| {
                let _complete = channel.completion_guard();
                self.discover(&channel)
            });
            let handles: Vec<_> = (0..workers.max(1))
                .map(|_| s.spawn(|| self.run_worker(&channel, &collection)))
                .collect();

            let discovered = join_worker(discovery, "ram discovery");
            let built = handles
                .into_iter()
                .enumerate()
                .map(|(i, handle)| join_worker(handle, format!("ram planner {i}")))
                .collect::<MemPlanResult<Vec<_>>>();
            let (discovered, built) = (discovered?, built?);
            debug_assert_eq!(discovered, built.iter().sum::<usize>());
            Ok(())
        })?;

        Ok(collection.into_segments())
    }
}
