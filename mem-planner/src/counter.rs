use crate::{
    arena::{ArenaExhausted, Chain, ChainEntry, SlotArena},
    chunk::{Chunk, ChunkBuffer},
    error::{MemPlanError, MemPlanResult},
    layout::{ShardLayout, MAX_PAGES},
    observer::{MemObserver, MemWorker},
};
use log::debug;
use std::time::Instant;

/// Dense offset table of one page, allocated the first time the shard touches the page.
#[derive(Debug)]
pub struct PageTable {
    /// Chain index plus one, zero when the word was never touched.
    slots: Vec<u32>,
    first: u32,
    last: u32,
}

impl PageTable {
    fn new(entries: u32) -> Self {
        Self {
            slots: vec![0; entries as usize],
            first: u32::MAX,
            last: 0,
        }
    }

    #[inline(always)]
    pub fn chain_index(&self, rel: u32) -> Option<usize> {
        match self.slots[rel as usize] {
            0 => None,
            slot => Some(slot as usize - 1),
        }
    }

    /// Lowest and highest touched offsets.
    #[inline(always)]
    pub fn range(&self) -> (u32, u32) {
        (self.first, self.last)
    }
}

/// Tallies the accesses of one shard of the address space over the whole chunk stream.
///
/// Every touched word gets a chain of `(chunk, count)` entries in chunk order, stored in a
/// pre-sized [`SlotArena`] owned by the counter.
#[derive(Debug)]
pub struct AddressCounter {
    shard: usize,
    layout: ShardLayout,
    pages: Vec<Option<PageTable>>,
    chains: Vec<Chain>,
    arena: SlotArena,
    chunks: usize,
    credits: usize,
}

impl AddressCounter {
    pub fn new(shard: usize, layout: ShardLayout, slot_blocks: usize) -> Self {
        Self {
            shard,
            layout,
            pages: (0..MAX_PAGES).map(|_| None).collect(),
            chains: Vec::with_capacity(slot_blocks),
            arena: SlotArena::new(slot_blocks),
            chunks: 0,
            credits: 0,
        }
    }

    #[inline(always)]
    pub fn shard(&self) -> usize {
        self.shard
    }

    #[inline(always)]
    pub fn layout(&self) -> ShardLayout {
        self.layout
    }

    #[inline(always)]
    pub fn arena(&self) -> &SlotArena {
        &self.arena
    }

    #[inline(always)]
    pub fn page(&self, page: usize) -> Option<&PageTable> {
        self.pages[page].as_ref()
    }

    #[inline(always)]
    pub fn chain_at(&self, page: usize, rel: u32) -> Option<&Chain> {
        self.page(page)?
            .chain_index(rel)
            .map(|index| &self.chains[index])
    }

    /// Chain of a word address owned by this shard.
    pub fn lookup(&self, addr: u32) -> Option<&Chain> {
        if self.layout.shard_of(addr) != self.shard {
            return None;
        }
        let (page, rel) = self.layout.locate(addr).ok()?;
        self.chain_at(page, rel)
    }

    /// Number of distinct words touched.
    pub fn addresses(&self) -> usize {
        self.chains.len()
    }

    /// Number of word credits applied, one per touched word per access.
    pub fn credits(&self) -> usize {
        self.credits
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Consumes the chunk stream until it is complete.
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
            observer.on_chunk(MemWorker::Counter(self.shard), chunk.id, wait, start.elapsed());
            index += 1;
        }
        debug!(
            "address counter {}: {} chunks, {} addresses, {} slot blocks",
            self.shard,
            self.chunks,
            self.chains.len(),
            self.arena.used_blocks()
        );
        Ok(())
    }

    /// Credits the words of this shard touched by the chunk.
    pub fn count_chunk(&mut self, chunk: &Chunk) -> MemPlanResult<()> {
        for data in chunk.data.iter() {
            let event = data.decode().map_err(|e| e.in_chunk(chunk.id))?;
            for (word, ops) in event.words() {
                if self.layout.shard_of(word) == self.shard {
                    self.credit(word, chunk.id, ops)
                        .map_err(|e| e.in_chunk(chunk.id))?;
                }
            }
        }
        self.chunks += 1;
        Ok(())
    }

    #[inline(always)]
    fn credit(&mut self, addr: u32, chunk_id: u32, count: u32) -> MemPlanResult<()> {
        let (page, rel) = self.layout.locate(addr)?;
        let Self {
            layout,
            pages,
            chains,
            arena,
            shard,
            credits,
            ..
        } = self;
        let (shard, capacity) = (*shard, arena.capacity());
        let exhausted = move |_: ArenaExhausted| MemPlanError::SlotArenaExhausted { shard, capacity };

        let table = pages[page].get_or_insert_with(|| PageTable::new(layout.entries_per_page()));
        match table.chain_index(rel) {
            None => {
                let chain = arena
                    .new_chain(ChainEntry { chunk_id, count })
                    .map_err(exhausted)?;
                chains.push(chain);
                table.slots[rel as usize] = chains.len() as u32;
                table.first = table.first.min(rel);
                table.last = table.last.max(rel);
            }
            Some(index) => {
                let chain = &mut chains[index];
                let last = arena.tail_entry(chain).chunk_id;
                if chunk_id < last {
                    return Err(MemPlanError::NonMonotonicChunk {
                        addr,
                        last,
                        found: chunk_id,
                    });
                }
                arena.append(chain, chunk_id, count).map_err(exhausted)?;
            }
        }
        *credits += 1;
        Ok(())
    }
}
