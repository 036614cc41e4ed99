use crate::layout::MemRegion;
use thiserror::Error;

pub type MemPlanResult<T> = Result<T, MemPlanError>;

/// Errors raised while counting or planning memory accesses.
///
/// Apart from [`MemPlanError::Io`], every variant means the producer or the planner left its
/// contract and the run cannot yield consistent segments.
#[derive(Error, Debug)]
pub enum MemPlanError {
    /// The address is not inside the ROM, input or RAM regions.
    #[error("address {addr:#010x} is outside every memory region")]
    AddressOutOfRange { addr: u32 },

    /// The bus record carries a width other than 1, 2, 4 or 8 bytes.
    #[error("invalid access width {width} at address {addr:#010x}")]
    InvalidAccessWidth { addr: u32, width: u32 },

    /// The access does not fit any alignment category.
    #[error("unsupported alignment operation at address {addr:#010x}: {rows} rows")]
    InvalidAlignOp { addr: u32, rows: u32 },

    /// A counter ran out of pre-allocated slot blocks.
    #[error("slot arena of shard {shard} exhausted ({capacity} blocks)")]
    SlotArenaExhausted { shard: usize, capacity: usize },

    /// A tally chain received a chunk older than its tail.
    #[error("chunk {found} counted after chunk {last} at address {addr:#010x}")]
    NonMonotonicChunk { addr: u32, last: u32, found: u32 },

    /// The chunk table is full.
    #[error("chunk table full ({capacity} chunks)")]
    ChunkTableFull { capacity: usize },

    /// A chunk was published out of sequence.
    #[error("chunk id gap: expected {expected}, found {found}")]
    ChunkIdGap { expected: u32, found: u32 },

    /// More rows were written to a segment than its capacity.
    #[error("{region} segment {segment_id} overflows: {requested} rows requested, {available} available")]
    RowBudgetOverflow {
        region: MemRegion,
        segment_id: u32,
        requested: u32,
        available: u32,
    },

    /// The discovery pass produced more boundaries than the locator channel holds.
    #[error("locator channel full ({capacity} locators)")]
    LocatorChannelFull { capacity: usize },

    /// A pipeline method was called in the wrong state.
    #[error("invalid pipeline state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    /// Invalid planner options.
    #[error("invalid options: {0}")]
    InvalidConfig(String),

    /// A pipeline thread panicked.
    #[error("worker {0} panicked")]
    WorkerPanicked(String),

    /// Wraps an error with the chunk being processed.
    #[error("chunk {chunk_id}: {source}")]
    Chunk {
        chunk_id: u32,
        #[source]
        source: Box<MemPlanError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MemPlanError {
    pub fn in_chunk(self, chunk_id: u32) -> Self {
        match self {
            err @ MemPlanError::Chunk { .. } => err,
            err => MemPlanError::Chunk {
                chunk_id,
                source: Box::new(err),
            },
        }
    }
}
