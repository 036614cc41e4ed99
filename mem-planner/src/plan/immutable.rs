use crate::{
    counter::AddressCounter,
    error::MemPlanResult,
    layout::{MemRegion, WORD_BYTES},
    observer::MemObserver,
    segment::{Segment, SegmentBuilder},
    walker::TallyWalker,
};
use log::debug;

/// Plans a region whose whole address range is witnessed.
///
/// Untouched words between two touched words of the same page become intermediate rows,
/// attributed to the chunk of the first access to the next touched word.
pub struct ImmutablePlanner<'a> {
    region: MemRegion,
    rows: u32,
    counters: &'a [AddressCounter],
    observer: &'a dyn MemObserver,
}

impl<'a> ImmutablePlanner<'a> {
    pub fn new(
        region: MemRegion,
        rows: u32,
        counters: &'a [AddressCounter],
        observer: &'a dyn MemObserver,
    ) -> Self {
        debug_assert!(region.is_immutable());
        Self {
            region,
            rows,
            counters,
            observer,
        }
    }

    pub fn plan(&self) -> MemPlanResult<Vec<Segment>> {
        let mut builder = SegmentBuilder::new(self.region, self.rows, self.observer);
        let mut intermediate = 0u64;
        let mut last: Option<(usize, u32)> = None;

        for run in TallyWalker::new(self.counters, self.region) {
            if let Some((page, prev)) = last {
                let gap = (run.addr - prev) / WORD_BYTES - 1;
                if page == run.page && gap > 0 {
                    builder.add_intermediate_rows(run.first_entry().chunk_id, prev + WORD_BYTES, gap)?;
                    intermediate += gap as u64;
                }
            }
            for (_, entry) in run.entries() {
                builder.add_rows(entry.chunk_id, run.addr, entry.count)?;
            }
            last = Some((run.page, run.addr));
        }

        let segments = builder.finish();
        debug!(
            "{} planned: {} segments, {} intermediate rows",
            self.region,
            segments.len(),
            intermediate
        );
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::MemBusData,
        chunk::Chunk,
        layout::{ShardLayout, INPUT_ADDR, ROM_ADDR, ROM_MIRROR_ADDR},
        observer::NoopObserver,
    };

    fn counters(shards: usize, chunks: &[Chunk]) -> Vec<AddressCounter> {
        let layout = ShardLayout::new(shards);
        (0..shards)
            .map(|shard| {
                let mut counter = AddressCounter::new(shard, layout, 256);
                for chunk in chunks {
                    counter.count_chunk(chunk).unwrap();
                }
                counter
            })
            .collect()
    }

    #[test]
    fn test_gap_fills_intermediate_rows() {
        // 3 untouched double-words between the two accesses
        let chunks = [
            Chunk::new(0, vec![MemBusData::read(ROM_ADDR, 8)]),
            Chunk::new(1, vec![MemBusData::read(ROM_ADDR + 32, 8)]),
        ];
        let counters = counters(4, &chunks);
        let segments = ImmutablePlanner::new(MemRegion::Rom, 1024, &counters, &NoopObserver)
            .plan()
            .unwrap();

        assert_eq!(segments.len(), 1);
        let segment = &segments[0];
        assert_eq!(segment.rows(), 5);
        let checkpoint = segment.checkpoint(1).unwrap();
        assert_eq!(checkpoint.intermediate_rows, 3);
        assert_eq!(checkpoint.total_rows, 4);
        assert_eq!(checkpoint.first_address, ROM_ADDR + 8);
        assert_eq!(checkpoint.last_address, ROM_ADDR + 32);
        assert_eq!(segment.checkpoint(0).unwrap().intermediate_rows, 0);
    }

    #[test]
    fn test_no_gap_rows_across_pages() {
        let chunks = [Chunk::new(
            0,
            vec![MemBusData::read(ROM_ADDR, 8), MemBusData::read(ROM_MIRROR_ADDR, 8)],
        )];
        let counters = counters(2, &chunks);
        let segments = ImmutablePlanner::new(MemRegion::Rom, 16, &counters, &NoopObserver)
            .plan()
            .unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].rows(), 2);
    }

    #[test]
    fn test_segments_respect_budget() {
        let data: Vec<_> = (0..50u32)
            .flat_map(|i| {
                let addr = INPUT_ADDR + (i * 3 % 17) * 8;
                [MemBusData::read(addr, 8), MemBusData::write(addr + 2, 2)]
            })
            .collect();
        let chunks: Vec<_> = data
            .chunks(30)
            .enumerate()
            .map(|(i, data)| Chunk::new(i as u32, data.to_vec()))
            .collect();
        let counters = counters(4, &chunks);
        let segments = ImmutablePlanner::new(MemRegion::Input, 7, &counters, &NoopObserver)
            .plan()
            .unwrap();

        let (last, full) = segments.split_last().unwrap();
        assert!(full.iter().all(|s| s.rows() == 7));
        assert!(last.rows() <= 7 && last.rows() > 0);
        assert!(last.is_last());

        // every access lands in exactly one row, the touched range 0..17 is dense
        let total: u32 = segments.iter().map(Segment::rows).sum();
        let accesses: u32 = 50 + 50 * 2;
        assert_eq!(total, accesses);
        assert_eq!(
            segments
                .iter()
                .flat_map(|s| s.checkpoints())
                .map(|c| c.intermediate_rows)
                .sum::<u32>(),
            0
        );

        for (prev, next) in segments.iter().zip(segments.iter().skip(1)) {
            let last = prev.last_checkpoint().unwrap();
            let first = next.first_checkpoint().unwrap();
            assert_eq!(first.chunk_id, last.chunk_id);
            assert_eq!(
                (first.first_address, first.first_address_skip),
                (last.last_address, last.last_address_count)
            );
        }
    }
}
