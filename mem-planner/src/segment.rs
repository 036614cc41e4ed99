use crate::{
    error::{MemPlanError, MemPlanResult},
    layout::{MemRegion, WORD_BYTES},
    observer::MemObserver,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::Mutex,
    time::Instant,
};

/// The slice of one chunk's accesses that lands in one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub chunk_id: u32,
    pub first_address: u32,
    /// Accesses of the chunk to `first_address` already placed in earlier rows.
    pub first_address_skip: u32,
    pub last_address: u32,
    /// Accesses of the chunk to `last_address` placed up to the end of this checkpoint.
    pub last_address_count: u32,
    pub total_rows: u32,
    /// Rows of `total_rows` filling untouched words.
    pub intermediate_rows: u32,
}

impl Checkpoint {
    fn new(chunk_id: u32, addr: u32, skip: u32) -> Self {
        Self {
            chunk_id,
            first_address: addr,
            first_address_skip: skip,
            last_address: addr,
            last_address_count: skip,
            total_rows: 0,
            intermediate_rows: 0,
        }
    }
}

/// Rows of one memory circuit instance, as checkpoints keyed by chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: u32,
    checkpoints: BTreeMap<u32, Checkpoint>,
    /// Chunk of the continuity reference, or of the first row.
    first_chunk_id: Option<u32>,
    /// Chunk of the last written row.
    last_chunk_id: Option<u32>,
    rows: u32,
    is_last: bool,
}

impl Segment {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Writes `rows` accesses of `chunk_id` to `addr`, following the first `skip` ones.
    ///
    /// With `rows == 0` this only records the position, which is how a segment carries the
    /// state left by its predecessor.
    pub fn add_rows(&mut self, chunk_id: u32, addr: u32, skip: u32, rows: u32) {
        let checkpoint = self
            .checkpoints
            .entry(chunk_id)
            .or_insert_with(|| Checkpoint::new(chunk_id, addr, skip));
        checkpoint.last_address = addr;
        checkpoint.last_address_count = skip + rows;
        checkpoint.total_rows += rows;
        self.first_chunk_id.get_or_insert(chunk_id);
        self.last_chunk_id = Some(chunk_id);
        self.rows += rows;
    }

    /// Writes `rows` untouched words starting at `addr`, attributed to `chunk_id`.
    pub fn add_intermediate_rows(&mut self, chunk_id: u32, addr: u32, rows: u32) {
        let checkpoint = self
            .checkpoints
            .entry(chunk_id)
            .or_insert_with(|| Checkpoint::new(chunk_id, addr, 0));
        checkpoint.last_address = addr + (rows - 1) * WORD_BYTES;
        checkpoint.last_address_count = 0;
        checkpoint.total_rows += rows;
        checkpoint.intermediate_rows += rows;
        self.first_chunk_id.get_or_insert(chunk_id);
        self.last_chunk_id = Some(chunk_id);
        self.rows += rows;
    }

    /// Checkpoints in chunk order.
    pub fn checkpoints(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.values()
    }

    pub fn checkpoint(&self, chunk_id: u32) -> Option<&Checkpoint> {
        self.checkpoints.get(&chunk_id)
    }

    pub fn chunks(&self) -> usize {
        self.checkpoints.len()
    }

    /// Checkpoint holding the first row, or the continuity reference.
    pub fn first_checkpoint(&self) -> Option<&Checkpoint> {
        self.first_chunk_id.and_then(|id| self.checkpoints.get(&id))
    }

    /// Checkpoint holding the last row.
    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.last_chunk_id.and_then(|id| self.checkpoints.get(&id))
    }

    #[inline(always)]
    pub fn rows(&self) -> u32 {
        self.rows
    }

    #[inline(always)]
    pub fn is_last(&self) -> bool {
        self.is_last
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

/// Completed segments of one region. Planner workers move their segments in under the lock.
#[derive(Debug, Default)]
pub struct SegmentCollection {
    segments: Mutex<BTreeMap<u32, Segment>>,
}

impl SegmentCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, segment: Segment) {
        let mut segments = self.segments.lock().unwrap_or_else(|e| e.into_inner());
        segments.insert(segment.id, segment);
    }

    pub fn len(&self) -> usize {
        self.segments.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Segments in id order, the final one flagged as last.
    pub fn into_segments(self) -> Vec<Segment> {
        let mut segments: Vec<_> = self
            .segments
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .into_values()
            .collect();
        if let Some(last) = segments.last_mut() {
            last.is_last = true;
        }
        segments
    }
}

/// Position of the last written row: where the next segment has to resume from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reference {
    chunk_id: u32,
    addr: u32,
    skip: u32,
}

/// Builds the segments of a region in a single sequential pass.
///
/// Segments are opened lazily, so a region whose rows end exactly at a segment boundary does
/// not produce an empty trailing segment.
pub struct SegmentBuilder<'a> {
    region: MemRegion,
    rows: u32,
    rows_available: u32,
    current: Option<Segment>,
    reference: Option<Reference>,
    segments: Vec<Segment>,
    observer: &'a dyn MemObserver,
    started: Instant,
}

impl<'a> SegmentBuilder<'a> {
    pub fn new(region: MemRegion, rows: u32, observer: &'a dyn MemObserver) -> Self {
        Self {
            region,
            rows,
            rows_available: 0,
            current: None,
            reference: None,
            segments: vec![],
            observer,
            started: Instant::now(),
        }
    }

    fn open_segment(&mut self) {
        let id = self.segments.len() as u32 + self.current.is_some() as u32;
        if let Some(done) = self.current.take() {
            self.close(done);
        }
        let mut segment = Segment::new(id);
        if let Some(reference) = self.reference {
            segment.add_rows(reference.chunk_id, reference.addr, reference.skip, 0);
        }
        self.current = Some(segment);
        self.rows_available = self.rows;
    }

    fn close(&mut self, segment: Segment) {
        debug!(
            "{} segment {}: {} rows, {} chunks",
            self.region,
            segment.id,
            segment.rows(),
            segment.chunks()
        );
        self.observer
            .on_segment(self.region, segment.id, segment.rows(), self.started.elapsed());
        self.started = Instant::now();
        self.segments.push(segment);
    }

    fn reserve(&mut self, pending: u32) -> MemPlanResult<(&mut Segment, u32)> {
        if self.rows_available == 0 || self.current.is_none() {
            self.open_segment();
        }
        let take = pending.min(self.rows_available);
        let segment = self.current.as_mut().ok_or(MemPlanError::InvalidState {
            expected: "open segment",
            found: "no segment",
        })?;
        if segment.rows() + take > self.rows {
            return Err(MemPlanError::RowBudgetOverflow {
                region: self.region,
                segment_id: segment.id,
                requested: take,
                available: self.rows - segment.rows(),
            });
        }
        self.rows_available -= take;
        Ok((segment, take))
    }

    /// Writes the `count` accesses of one chain entry, splitting them over as many segments as
    /// needed.
    pub fn add_rows(&mut self, chunk_id: u32, addr: u32, count: u32) -> MemPlanResult<()> {
        let mut skip = 0;
        while skip < count {
            let (segment, take) = self.reserve(count - skip)?;
            segment.add_rows(chunk_id, addr, skip, take);
            skip += take;
            self.reference = Some(Reference {
                chunk_id,
                addr,
                skip,
            });
        }
        Ok(())
    }

    /// Writes `count` untouched words starting at `addr`.
    pub fn add_intermediate_rows(&mut self, chunk_id: u32, addr: u32, count: u32) -> MemPlanResult<()> {
        let mut done = 0;
        while done < count {
            let first = addr + done * WORD_BYTES;
            let (segment, take) = self.reserve(count - done)?;
            segment.add_intermediate_rows(chunk_id, first, take);
            done += take;
            self.reference = Some(Reference {
                chunk_id,
                addr: first + (take - 1) * WORD_BYTES,
                skip: 0,
            });
        }
        Ok(())
    }

    pub fn finish(mut self) -> Vec<Segment> {
        if let Some(done) = self.current.take() {
            self.close(done);
        }
        if let Some(last) = self.segments.last_mut() {
            last.is_last = true;
        }
        self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layout::RAM_ADDR, observer::NoopObserver};

    #[test]
    fn test_builder_splits_and_carries_reference() {
        let mut builder = SegmentBuilder::new(MemRegion::Ram, 10, &NoopObserver);
        builder.add_rows(0, RAM_ADDR, 4).unwrap();
        builder.add_rows(1, RAM_ADDR, 9).unwrap();
        builder.add_rows(1, RAM_ADDR + 8, 7).unwrap();
        let segments = builder.finish();

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].rows(), 10);
        assert_eq!(segments[1].rows(), 10);
        assert!(segments[1].is_last());
        assert!(!segments[0].is_last());

        let split = segments[0].checkpoint(1).unwrap();
        assert_eq!(
            (split.first_address, split.first_address_skip, split.last_address_count),
            (RAM_ADDR, 0, 6)
        );
        let resumed = segments[1].first_checkpoint().unwrap();
        assert_eq!(resumed.chunk_id, 1);
        assert_eq!((resumed.first_address, resumed.first_address_skip), (RAM_ADDR, 6));
        assert_eq!(resumed.last_address, RAM_ADDR + 8);
        assert_eq!(resumed.last_address_count, 7);
        assert_eq!(resumed.total_rows, 10);
    }

    #[test]
    fn test_exact_fit_has_no_empty_segment() {
        let mut builder = SegmentBuilder::new(MemRegion::Ram, 8, &NoopObserver);
        builder.add_rows(0, RAM_ADDR, 8).unwrap();
        let segments = builder.finish();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].rows(), 8);

        // the next entry starts a segment seeded with the exhausted one
        let mut builder = SegmentBuilder::new(MemRegion::Ram, 8, &NoopObserver);
        builder.add_rows(3, RAM_ADDR, 8).unwrap();
        builder.add_rows(2, RAM_ADDR + 8, 1).unwrap();
        let segments = builder.finish();
        assert_eq!(segments.len(), 2);
        let reference = segments[1].checkpoint(3).unwrap();
        assert_eq!(reference.total_rows, 0);
        assert_eq!((reference.first_address_skip, reference.last_address_count), (8, 8));
        assert_eq!(segments[1].first_checkpoint(), Some(reference));
        assert_eq!(segments[1].checkpoints().next().unwrap().chunk_id, 2);
    }

    #[test]
    fn test_intermediate_rows() {
        let mut builder = SegmentBuilder::new(MemRegion::Rom, 4, &NoopObserver);
        builder.add_rows(0, RAM_ADDR, 1).unwrap();
        builder.add_intermediate_rows(2, RAM_ADDR + 8, 5).unwrap();
        builder.add_rows(2, RAM_ADDR + 48, 1).unwrap();
        let segments = builder.finish();

        assert_eq!(segments.iter().map(Segment::rows).collect::<Vec<_>>(), vec![4, 3]);
        let gap = segments[0].checkpoint(2).unwrap();
        assert_eq!((gap.first_address, gap.last_address), (RAM_ADDR + 8, RAM_ADDR + 24));
        assert_eq!(gap.intermediate_rows, 3);

        let resumed = segments[1].checkpoint(2).unwrap();
        assert_eq!((resumed.first_address, resumed.first_address_skip), (RAM_ADDR + 24, 0));
        assert_eq!(resumed.intermediate_rows, 2);
        assert_eq!((resumed.last_address, resumed.last_address_count), (RAM_ADDR + 48, 1));
    }

    #[test]
    fn test_collection_orders_segments() {
        let collection = SegmentCollection::new();
        for id in [2, 0, 1] {
            let mut segment = Segment::new(id);
            segment.add_rows(id, RAM_ADDR, 0, 1);
            collection.insert(segment);
        }
        assert_eq!(collection.len(), 3);
        let segments = collection.into_segments();
        assert_eq!(segments.iter().map(|s| s.id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(segments[2].is_last());
    }
}
