//! Fixed-capacity arena of slot blocks holding the per-address `(chunk, count)` chains.
//!
//! Blocks are allocated up front and linked by integer handles. A chain only ever appends to
//! its tail block, so every block of a chain except the tail is full.

use serde::{Deserialize, Serialize};

/// Entries stored in a single slot block.
pub const SLOT_BLOCK_ENTRIES: usize = 6;

/// Handle of a block inside a [`SlotArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHandle(u32);

impl BlockHandle {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Position of one entry: its block and the slot inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainPos {
    pub block: BlockHandle,
    pub slot: u8,
}

/// Accesses of one chunk to one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub chunk_id: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Copy)]
struct SlotBlock {
    entries: [ChainEntry; SLOT_BLOCK_ENTRIES],
    len: u8,
    next: Option<BlockHandle>,
}

impl SlotBlock {
    const EMPTY: SlotBlock = SlotBlock {
        entries: [ChainEntry {
            chunk_id: 0,
            count: 0,
        }; SLOT_BLOCK_ENTRIES],
        len: 0,
        next: None,
    };

    #[inline(always)]
    fn is_full(&self) -> bool {
        self.len as usize == SLOT_BLOCK_ENTRIES
    }
}

/// One address's chain. `tail` is the only block that may still have free slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chain {
    pub head: BlockHandle,
    pub tail: BlockHandle,
    /// Accesses over all entries.
    pub total: u32,
}

/// Returned when the arena has no free block left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaExhausted;

#[derive(Debug)]
pub struct SlotArena {
    blocks: Vec<SlotBlock>,
    capacity: usize,
}

impl SlotArena {
    /// Reserves room for `capacity` blocks, no allocation happens afterwards.
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub fn used_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn alloc_block(&mut self) -> Result<BlockHandle, ArenaExhausted> {
        if self.blocks.len() >= self.capacity {
            return Err(ArenaExhausted);
        }
        self.blocks.push(SlotBlock::EMPTY);
        Ok(BlockHandle(self.blocks.len() as u32 - 1))
    }

    /// Starts a chain holding a single entry.
    pub fn new_chain(&mut self, entry: ChainEntry) -> Result<Chain, ArenaExhausted> {
        let head = self.alloc_block()?;
        let block = &mut self.blocks[head.index()];
        block.entries[0] = entry;
        block.len = 1;
        Ok(Chain {
            head,
            tail: head,
            total: entry.count,
        })
    }

    /// Last entry of the chain.
    #[inline(always)]
    pub fn tail_entry(&self, chain: &Chain) -> ChainEntry {
        let block = &self.blocks[chain.tail.index()];
        block.entries[block.len as usize - 1]
    }

    #[inline(always)]
    pub fn tail_pos(&self, chain: &Chain) -> ChainPos {
        ChainPos {
            block: chain.tail,
            slot: self.blocks[chain.tail.index()].len - 1,
        }
    }

    /// Adds `count` accesses of `chunk_id`. The tail entry absorbs them when it belongs to the
    /// same chunk, otherwise a new entry is appended, linking a fresh block when the tail is full.
    #[inline(always)]
    pub fn append(
        &mut self,
        chain: &mut Chain,
        chunk_id: u32,
        count: u32,
    ) -> Result<(), ArenaExhausted> {
        let tail = &mut self.blocks[chain.tail.index()];
        let last = tail.len as usize - 1;
        if tail.entries[last].chunk_id == chunk_id {
            tail.entries[last].count += count;
        } else if !tail.is_full() {
            tail.entries[last + 1] = ChainEntry { chunk_id, count };
            tail.len += 1;
        } else {
            let next = self.alloc_block()?;
            let block = &mut self.blocks[next.index()];
            block.entries[0] = ChainEntry { chunk_id, count };
            block.len = 1;
            self.blocks[chain.tail.index()].next = Some(next);
            chain.tail = next;
        }
        chain.total += count;
        Ok(())
    }

    #[inline(always)]
    pub fn entry(&self, pos: ChainPos) -> ChainEntry {
        self.blocks[pos.block.index()].entries[pos.slot as usize]
    }

    /// Entries of the chain starting at `head`.
    pub fn iter(&self, head: BlockHandle) -> ChainIter<'_> {
        self.iter_from(ChainPos {
            block: head,
            slot: 0,
        })
    }

    /// Entries of a chain starting at an arbitrary position.
    pub fn iter_from(&self, pos: ChainPos) -> ChainIter<'_> {
        ChainIter {
            arena: self,
            pos: Some(pos),
        }
    }
}

pub struct ChainIter<'a> {
    arena: &'a SlotArena,
    pos: Option<ChainPos>,
}

impl Iterator for ChainIter<'_> {
    type Item = (ChainPos, ChainEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.pos?;
        let block = &self.arena.blocks[pos.block.index()];
        if pos.slot >= block.len {
            self.pos = None;
            return None;
        }
        self.pos = if pos.slot as usize + 1 < block.len as usize {
            Some(ChainPos {
                block: pos.block,
                slot: pos.slot + 1,
            })
        } else {
            block.next.map(|block| ChainPos { block, slot: 0 })
        };
        Some((pos, block.entries[pos.slot as usize]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_coalesces_and_overflows() {
        let mut arena = SlotArena::new(4);
        let mut chain = arena
            .new_chain(ChainEntry {
                chunk_id: 0,
                count: 1,
            })
            .unwrap();
        arena.append(&mut chain, 0, 2).unwrap();
        assert_eq!(arena.used_blocks(), 1);
        assert_eq!(
            arena.tail_entry(&chain),
            ChainEntry {
                chunk_id: 0,
                count: 3
            }
        );

        for chunk_id in 1..=SLOT_BLOCK_ENTRIES as u32 {
            arena.append(&mut chain, chunk_id, chunk_id).unwrap();
        }
        assert_eq!(arena.used_blocks(), 2);
        assert_ne!(chain.head, chain.tail);
        assert_eq!(arena.tail_pos(&chain).slot, 0);

        let entries: Vec<_> = arena.iter(chain.head).map(|(_, e)| e).collect();
        assert_eq!(entries.len(), SLOT_BLOCK_ENTRIES + 1);
        assert!(entries.windows(2).all(|w| w[0].chunk_id < w[1].chunk_id));
        assert_eq!(chain.total, entries.iter().map(|e| e.count).sum::<u32>());

        let (pos, entry) = arena.iter(chain.head).nth(3).unwrap();
        assert_eq!(arena.entry(pos), entry);
        assert_eq!(arena.iter_from(pos).count(), SLOT_BLOCK_ENTRIES + 1 - 3);
    }

    #[test]
    fn test_exhaustion() {
        let mut arena = SlotArena::new(1);
        let mut chain = arena
            .new_chain(ChainEntry {
                chunk_id: 0,
                count: 1,
            })
            .unwrap();
        for chunk_id in 1..SLOT_BLOCK_ENTRIES as u32 {
            arena.append(&mut chain, chunk_id, 1).unwrap();
        }
        assert_eq!(
            arena.append(&mut chain, SLOT_BLOCK_ENTRIES as u32, 1),
            Err(ArenaExhausted)
        );
        assert_eq!(arena.alloc_block(), Err(ArenaExhausted));
    }
}
