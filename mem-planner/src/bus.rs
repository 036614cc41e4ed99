//! Memory bus records produced by the emulator.
//!
//! A record is 8 bytes, `addr: u32` followed by `flags: u32`:
//!
//! | Bits    | Meaning                                        |
//! | ------- | ---------------------------------------------- |
//! | 0..8    | access width in bytes (1, 2, 4 or 8)           |
//! | 16..32  | extra sub-operations, non-zero on writes       |

use crate::{
    error::{MemPlanError, MemPlanResult},
    layout::{word_of, WORD_BYTES},
};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, ErrorKind},
    path::Path,
};

const WIDTH_MASK: u32 = 0xFF;
const WRITE_FLAG: u32 = 0x1_0000;
const EXTRA_OPS_SHIFT: u32 = 16;

/// Raw record as laid out on the bus.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct MemBusData {
    pub addr: u32,
    pub flags: u32,
}

impl MemBusData {
    /// Builds a plain read or write. Writes carry one extra sub-operation.
    pub const fn new(addr: u32, width: u32, is_write: bool) -> Self {
        let flags = if is_write { width | WRITE_FLAG } else { width };
        Self { addr, flags }
    }

    pub const fn read(addr: u32, width: u32) -> Self {
        Self::new(addr, width, false)
    }

    pub const fn write(addr: u32, width: u32) -> Self {
        Self::new(addr, width, true)
    }

    /// Decodes and validates the record.
    #[inline(always)]
    pub fn decode(&self) -> MemPlanResult<AccessEvent> {
        let width = self.flags & WIDTH_MASK;
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(MemPlanError::InvalidAccessWidth {
                addr: self.addr,
                width,
            });
        }
        Ok(AccessEvent {
            address: self.addr,
            width,
            is_write: self.flags & WRITE_FLAG != 0,
            extra_ops: self.flags >> EXTRA_OPS_SHIFT,
        })
    }
}

/// One decoded memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessEvent {
    pub address: u32,
    pub width: u32,
    pub is_write: bool,
    pub extra_ops: u32,
}

impl AccessEvent {
    /// Word-aligned 8-byte accesses are the only ones that need no alignment handling.
    #[inline(always)]
    pub const fn is_aligned(&self) -> bool {
        self.width == WORD_BYTES && self.address & (WORD_BYTES - 1) == 0
    }

    /// The access spills into the next word.
    #[inline(always)]
    pub const fn crosses_word(&self) -> bool {
        (self.address & (WORD_BYTES - 1)) + self.width > WORD_BYTES
    }

    /// Operations performed on every word touched by the access.
    #[inline(always)]
    pub const fn ops_by_addr(&self) -> u32 {
        1 + self.extra_ops
    }

    /// The words touched by the access, each with the operations it is credited with.
    #[inline(always)]
    pub fn words(&self) -> impl Iterator<Item = (u32, u32)> {
        let (first, ops, count) = if self.is_aligned() {
            (self.address, 1, 1)
        } else {
            let count = if self.crosses_word() { 2 } else { 1 };
            (word_of(self.address), self.ops_by_addr(), count)
        };
        (0..count).map(move |i| (first.wrapping_add(i * WORD_BYTES), ops))
    }
}

/// Loads a chunk saved with [`save_chunk_file`].
pub fn load_chunk_file(path: impl AsRef<Path>) -> MemPlanResult<Vec<MemBusData>> {
    let bytes = fs::read(path.as_ref())?;
    if bytes.len() % std::mem::size_of::<MemBusData>() != 0 {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!(
                "{}: {} bytes is not a whole number of bus records",
                path.as_ref().display(),
                bytes.len()
            ),
        )
        .into());
    }
    // the byte buffer carries no alignment guarantee, so copy record by record
    Ok(bytes
        .chunks_exact(std::mem::size_of::<MemBusData>())
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

/// Saves a chunk as the raw concatenation of its records.
pub fn save_chunk_file(path: impl AsRef<Path>, data: &[MemBusData]) -> MemPlanResult<()> {
    fs::write(path, bytemuck::cast_slice::<MemBusData, u8>(data))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::RAM_ADDR;

    #[test]
    fn test_decode() {
        let event = MemBusData::write(RAM_ADDR + 3, 4).decode().unwrap();
        assert_eq!(event.width, 4);
        assert!(event.is_write);
        assert_eq!(event.extra_ops, 1);
        assert!(!event.is_aligned());
        assert!(!event.crosses_word());

        let event = MemBusData::read(RAM_ADDR, 8).decode().unwrap();
        assert!(event.is_aligned());
        assert_eq!(event.extra_ops, 0);

        let err = MemBusData { addr: RAM_ADDR, flags: 3 }.decode().unwrap_err();
        assert!(matches!(err, MemPlanError::InvalidAccessWidth { width: 3, .. }));
    }

    #[test]
    fn test_words() {
        let aligned = MemBusData::write(RAM_ADDR + 8, 8).decode().unwrap();
        assert_eq!(aligned.words().collect::<Vec<_>>(), vec![(RAM_ADDR + 8, 1)]);

        let narrow = MemBusData::write(RAM_ADDR + 3, 4).decode().unwrap();
        assert_eq!(narrow.words().collect::<Vec<_>>(), vec![(RAM_ADDR, 2)]);

        let crossing = MemBusData::read(RAM_ADDR + 6, 4).decode().unwrap();
        assert_eq!(
            crossing.words().collect::<Vec<_>>(),
            vec![(RAM_ADDR, 1), (RAM_ADDR + 8, 1)]
        );

        let misaligned_word = MemBusData::read(RAM_ADDR + 4, 8).decode().unwrap();
        assert_eq!(misaligned_word.words().count(), 2);
    }

    #[test]
    fn test_chunk_file() {
        let dir = std::env::temp_dir().join(format!("mem-planner-bus-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("chunk_0.bin");

        let data = vec![
            MemBusData::read(RAM_ADDR, 8),
            MemBusData::write(RAM_ADDR + 13, 2),
        ];
        save_chunk_file(&path, &data).unwrap();
        assert_eq!(load_chunk_file(&path).unwrap(), data);

        fs::write(&path, [0u8; 12]).unwrap();
        assert!(matches!(load_chunk_file(&path), Err(MemPlanError::Io(_))));
        assert!(matches!(
            load_chunk_file(dir.join("missing.bin")),
            Err(MemPlanError::Io(_))
        ));

        fs::remove_dir_all(&dir).unwrap();
    }
}
