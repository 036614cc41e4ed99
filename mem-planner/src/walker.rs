use crate::{
    arena::{Chain, ChainEntry, ChainIter, ChainPos},
    counter::AddressCounter,
    layout::{MemRegion, ShardLayout},
};
use std::ops::Range;

/// One touched word and its tally chain.
#[derive(Clone, Copy)]
pub struct AddressRun<'a> {
    pub shard: usize,
    pub page: usize,
    pub rel: u32,
    pub addr: u32,
    pub chain: &'a Chain,
    counter: &'a AddressCounter,
}

impl<'a> AddressRun<'a> {
    /// Shard offset of the word, as stored in a locator.
    #[inline(always)]
    pub fn offset(&self) -> u32 {
        self.counter.layout().offset(self.page, self.rel)
    }

    pub fn entries(&self) -> ChainIter<'a> {
        self.counter.arena().iter(self.chain.head)
    }

    pub fn entries_from(&self, pos: ChainPos) -> ChainIter<'a> {
        self.counter.arena().iter_from(pos)
    }

    pub fn first_entry(&self) -> ChainEntry {
        self.counter.arena().entry(ChainPos {
            block: self.chain.head,
            slot: 0,
        })
    }

    pub fn tail(&self) -> (ChainPos, ChainEntry) {
        let arena = self.counter.arena();
        (arena.tail_pos(self.chain), arena.tail_entry(self.chain))
    }
}

/// Visits the touched words of a region in ascending address order.
///
/// Shards interleave word by word, so the walk goes offset by offset and, for each offset,
/// over the shards in order.
pub struct TallyWalker<'a> {
    counters: &'a [AddressCounter],
    pages: Range<usize>,
    page: usize,
    rel: u32,
    rel_end: u32,
    shard: usize,
    page_ready: bool,
}

impl<'a> TallyWalker<'a> {
    pub fn new(counters: &'a [AddressCounter], region: MemRegion) -> Self {
        let pages = region.pages();
        Self {
            counters,
            page: pages.start,
            pages,
            rel: 0,
            rel_end: 0,
            shard: 0,
            page_ready: false,
        }
    }

    /// Starts at the word `offset` of `shard`, visiting it first.
    pub fn resume(
        counters: &'a [AddressCounter],
        region: MemRegion,
        layout: ShardLayout,
        shard: usize,
        offset: u32,
    ) -> Self {
        let (page, rel) = layout.split(offset);
        Self {
            counters,
            pages: region.pages(),
            page,
            rel,
            rel_end: 0,
            shard,
            page_ready: false,
        }
    }

    /// Computes the touched offset range of the current page over all shards.
    fn prepare_page(&mut self) -> bool {
        let range = self
            .counters
            .iter()
            .filter_map(|counter| counter.page(self.page).map(|table| table.range()))
            .reduce(|(lo, hi), (first, last)| (lo.min(first), hi.max(last)));
        let Some((first, last)) = range else {
            return false;
        };
        if self.rel < first {
            self.rel = first;
            self.shard = 0;
        }
        self.rel_end = last;
        self.page_ready = true;
        true
    }

    fn next_page(&mut self) {
        self.page += 1;
        self.rel = 0;
        self.shard = 0;
        self.page_ready = false;
    }
}

impl<'a> Iterator for TallyWalker<'a> {
    type Item = AddressRun<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.page >= self.pages.end {
                return None;
            }
            if !self.page_ready && !self.prepare_page() {
                self.next_page();
                continue;
            }
            if self.rel > self.rel_end {
                self.next_page();
                continue;
            }

            let (shard, rel) = (self.shard, self.rel);
            self.shard += 1;
            if self.shard == self.counters.len() {
                self.shard = 0;
                self.rel += 1;
            }

            let counter = &self.counters[shard];
            if let Some(chain) = counter.chain_at(self.page, rel) {
                return Some(AddressRun {
                    shard,
                    page: self.page,
                    rel,
                    addr: counter.layout().address(shard, self.page, rel),
                    chain,
                    counter,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::MemBusData,
        chunk::Chunk,
        layout::{INPUT_ADDR, RAM_ADDR, ROM_ADDR, ROM_MIRROR_ADDR},
    };

    fn counters(shards: usize, data: Vec<MemBusData>) -> Vec<AddressCounter> {
        let layout = ShardLayout::new(shards);
        let chunk = Chunk::new(0, data);
        (0..shards)
            .map(|shard| {
                let mut counter = AddressCounter::new(shard, layout, 64);
                counter.count_chunk(&chunk).unwrap();
                counter
            })
            .collect()
    }

    #[test]
    fn test_walk_is_address_ordered() {
        let addrs = [
            RAM_ADDR + 0x100,
            ROM_ADDR + 0x10,
            RAM_ADDR + 0x8,
            ROM_MIRROR_ADDR,
            RAM_ADDR + 0x1000_0000,
            INPUT_ADDR,
            RAM_ADDR + 0x18,
            RAM_ADDR,
        ];
        let counters = counters(4, addrs.iter().map(|&a| MemBusData::read(a, 8)).collect());

        let ram: Vec<u32> = TallyWalker::new(&counters, MemRegion::Ram).map(|r| r.addr).collect();
        assert_eq!(
            ram,
            vec![RAM_ADDR, RAM_ADDR + 0x8, RAM_ADDR + 0x18, RAM_ADDR + 0x100, RAM_ADDR + 0x1000_0000]
        );
        let rom: Vec<u32> = TallyWalker::new(&counters, MemRegion::Rom).map(|r| r.addr).collect();
        assert_eq!(rom, vec![ROM_ADDR + 0x10, ROM_MIRROR_ADDR]);
        assert_eq!(TallyWalker::new(&counters, MemRegion::Input).count(), 1);
    }

    #[test]
    fn test_resume_from_offset() {
        let data = (0..32u32).map(|i| MemBusData::read(RAM_ADDR + i * 24, 8)).collect();
        let counters = counters(2, data);
        let layout = counters[0].layout();
        let all: Vec<_> = TallyWalker::new(&counters, MemRegion::Ram).collect();

        for run in all.iter() {
            let resumed: Vec<u32> =
                TallyWalker::resume(&counters, MemRegion::Ram, layout, run.shard, run.offset())
                    .map(|r| r.addr)
                    .collect();
            let expected: Vec<u32> = all.iter().map(|r| r.addr).filter(|&a| a >= run.addr).collect();
            assert_eq!(resumed, expected);
        }
    }
}
