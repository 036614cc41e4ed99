//! Address map of the emulator memory and the shard/offset arithmetic used by the counters.
//!
//! The physical space covered by the planner is split into 64 MiB pages starting at
//! `0x8000_0000`. Every region owns a contiguous range of pages:
//!
//! | Region | Pages  | Addresses                         |
//! | ------ | ------ | --------------------------------- |
//! | ROM    | 0..2   | `0x8000_0000..0x8800_0000` (mirror at `0x8400_0000`) |
//! | Input  | 2..4   | `0x9000_0000..0x9800_0000`        |
//! | RAM    | 4..20  | `0xA000_0000..0xE000_0000`        |
//!
//! Pages 2 and 3 of the raw page index (`0x8800_0000..0x9000_0000`) are not mapped, so the
//! table below is keyed by the high address bits instead of a plain subtraction.

use crate::error::{MemPlanError, MemPlanResult};
use serde::{Deserialize, Serialize};
use std::{fmt, ops::Range};
use strum_macros::EnumIter;

pub const ROM_ADDR: u32 = 0x8000_0000;
pub const ROM_MIRROR_ADDR: u32 = 0x8400_0000;
pub const ROM_SIZE: u32 = 0x0800_0000;
pub const INPUT_ADDR: u32 = 0x9000_0000;
pub const INPUT_SIZE: u32 = 0x0800_0000;
pub const RAM_ADDR: u32 = 0xA000_0000;
pub const RAM_SIZE: u32 = 0x4000_0000;

const BASE_ADDR: u32 = ROM_ADDR;

/// log2 of the page size in bytes.
pub const PAGE_BITS: u32 = 26;
pub const PAGE_SIZE: u32 = 1 << PAGE_BITS;

/// Number of mapped pages over all regions.
pub const MAX_PAGES: usize = 20;

/// Width of a memory word in bytes.
pub const WORD_BYTES: u32 = 8;
const WORD_BITS: u32 = 3;

/// Memory regions planned independently, each one backing a different memory circuit.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter, Ord, PartialOrd, Serialize, Deserialize,
)]
pub enum MemRegion {
    Rom,
    Input,
    Ram,
}

impl MemRegion {
    /// Pages owned by the region.
    #[inline(always)]
    pub const fn pages(self) -> Range<usize> {
        match self {
            MemRegion::Rom => 0..2,
            MemRegion::Input => 2..4,
            MemRegion::Ram => 4..MAX_PAGES,
        }
    }

    /// Immutable regions are walked densely: untouched words between touched ones still cost rows.
    #[inline(always)]
    pub const fn is_immutable(self) -> bool {
        !matches!(self, MemRegion::Ram)
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn of_page(page: usize) -> MemRegion {
        match page {
            0 | 1 => MemRegion::Rom,
            2 | 3 => MemRegion::Input,
            _ => MemRegion::Ram,
        }
    }
}

impl fmt::Display for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemRegion::Rom => "rom",
            MemRegion::Input => "input",
            MemRegion::Ram => "ram",
        };
        f.write_str(name)
    }
}

/// Page index of an address, `None` when the address is outside every region.
#[inline(always)]
pub const fn page_of(addr: u32) -> Option<usize> {
    if addr < BASE_ADDR {
        return None;
    }
    let raw = ((addr - BASE_ADDR) >> PAGE_BITS) as usize;
    match raw {
        0 | 1 => Some(raw),
        4 | 5 => Some(raw - 2),
        8..=23 => Some(raw - 4),
        _ => None,
    }
}

/// First address of a page.
#[inline(always)]
pub const fn page_base(page: usize) -> u32 {
    let raw = match page {
        0 | 1 => page,
        2 | 3 => page + 2,
        _ => page + 4,
    };
    BASE_ADDR + ((raw as u32) << PAGE_BITS)
}

/// Aligned word containing `addr`.
#[inline(always)]
pub const fn word_of(addr: u32) -> u32 {
    addr & !(WORD_BYTES - 1)
}

/// Distributes words over `shards` counters by their low word-index bits.
///
/// Each shard sees a page as a dense array of `entries_per_page` words, so offsets of one shard
/// are contiguous and ascending offsets mean ascending addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    shard_bits: u32,
}

impl ShardLayout {
    /// `shards` must be a power of two, checked by the options validation.
    pub fn new(shards: usize) -> Self {
        debug_assert!(shards.is_power_of_two());
        Self {
            shard_bits: shards.trailing_zeros(),
        }
    }

    #[inline(always)]
    pub const fn shards(&self) -> usize {
        1 << self.shard_bits
    }

    #[inline(always)]
    pub const fn entries_per_page(&self) -> u32 {
        1 << (PAGE_BITS - WORD_BITS - self.shard_bits)
    }

    #[inline(always)]
    pub const fn shard_of(&self, addr: u32) -> usize {
        ((addr >> WORD_BITS) as usize) & ((1 << self.shard_bits) - 1)
    }

    /// Maps a word address to `(page, offset inside the page)` for its own shard.
    #[inline(always)]
    pub fn locate(&self, addr: u32) -> MemPlanResult<(usize, u32)> {
        let page = page_of(addr).ok_or(MemPlanError::AddressOutOfRange { addr })?;
        let rel = (addr - page_base(page)) >> (WORD_BITS + self.shard_bits);
        Ok((page, rel))
    }

    /// Flattens `(page, offset inside the page)` into a single shard offset.
    #[inline(always)]
    pub const fn offset(&self, page: usize, rel: u32) -> u32 {
        ((page as u32) << (PAGE_BITS - WORD_BITS - self.shard_bits)) | rel
    }

    /// Inverse of [`ShardLayout::offset`].
    #[inline(always)]
    pub const fn split(&self, offset: u32) -> (usize, u32) {
        let bits = PAGE_BITS - WORD_BITS - self.shard_bits;
        ((offset >> bits) as usize, offset & ((1 << bits) - 1))
    }

    /// Inverse of [`ShardLayout::locate`].
    #[inline(always)]
    pub const fn address(&self, shard: usize, page: usize, rel: u32) -> u32 {
        page_base(page) + (rel << (WORD_BITS + self.shard_bits)) + ((shard as u32) << WORD_BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_page_mapping() {
        assert_eq!(page_of(ROM_ADDR), Some(0));
        assert_eq!(page_of(ROM_MIRROR_ADDR), Some(1));
        assert_eq!(page_of(INPUT_ADDR), Some(2));
        assert_eq!(page_of(INPUT_ADDR + INPUT_SIZE - 8), Some(3));
        assert_eq!(page_of(RAM_ADDR), Some(4));
        assert_eq!(page_of(RAM_ADDR + RAM_SIZE - 8), Some(19));

        assert_eq!(page_of(0x7fff_fff8), None);
        assert_eq!(page_of(ROM_ADDR + ROM_SIZE), None);
        assert_eq!(page_of(INPUT_ADDR + INPUT_SIZE), None);
        assert_eq!(page_of(RAM_ADDR + RAM_SIZE), None);

        for page in 0..MAX_PAGES {
            assert_eq!(page_of(page_base(page)), Some(page));
        }
    }

    #[test]
    fn test_regions_cover_pages() {
        let pages: Vec<usize> = MemRegion::iter().flat_map(|r| r.pages()).collect();
        assert_eq!(pages, (0..MAX_PAGES).collect::<Vec<_>>());
        for page in 0..MAX_PAGES {
            assert!(MemRegion::of_page(page).pages().contains(&page));
        }
    }

    #[test]
    fn test_locate_roundtrip() {
        let layout = ShardLayout::new(4);
        assert_eq!(layout.entries_per_page(), 1 << 21);
        for addr in [ROM_ADDR, ROM_ADDR + 0x18, INPUT_ADDR + 0x1230, RAM_ADDR + 0x3fff_fff8] {
            let shard = layout.shard_of(addr);
            let (page, rel) = layout.locate(addr).unwrap();
            assert_eq!(layout.address(shard, page, rel), addr);
            assert_eq!(layout.split(layout.offset(page, rel)), (page, rel));
        }
        assert_eq!(layout.shard_of(RAM_ADDR + 8), 1);
        assert_eq!(layout.shard_of(RAM_ADDR + 32), 0);
        assert!(matches!(
            layout.locate(0x1000),
            Err(MemPlanError::AddressOutOfRange { addr: 0x1000 })
        ));
    }
}
