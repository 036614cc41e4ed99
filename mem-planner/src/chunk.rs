use crate::{
    bus::MemBusData,
    error::{MemPlanError, MemPlanResult},
};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// A batch of bus records published by the emulator.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: u32,
    pub data: Vec<MemBusData>,
}

impl Chunk {
    pub fn new(id: u32, data: Vec<MemBusData>) -> Self {
        Self { id, data }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Default)]
struct ChunkTable {
    chunks: Vec<Arc<Chunk>>,
    completed: bool,
}

/// Append-only staging area shared by every consumer of the chunk stream.
///
/// Readers never remove chunks: each consumer walks the indices at its own pace with
/// [`ChunkBuffer::await_chunk`] and blocks on a condition variable until the chunk exists
/// or the stream is complete.
#[derive(Debug)]
pub struct ChunkBuffer {
    table: Mutex<ChunkTable>,
    published: Condvar,
    capacity: usize,
}

impl ChunkBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(ChunkTable {
                chunks: Vec::with_capacity(capacity.min(1 << 12)),
                completed: false,
            }),
            published: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChunkTable> {
        // a poisoned table still holds consistent data, every write is a single push
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publishes the records as the next chunk and returns its id.
    pub fn add(&self, data: Vec<MemBusData>) -> MemPlanResult<u32> {
        let mut table = self.lock();
        let id = table.chunks.len() as u32;
        self.push(&mut table, Chunk::new(id, data))?;
        Ok(id)
    }

    /// Publishes a chunk carrying its own id, which must be the next one.
    pub fn publish(&self, chunk: Chunk) -> MemPlanResult<()> {
        let mut table = self.lock();
        let expected = table.chunks.len() as u32;
        if chunk.id != expected {
            return Err(MemPlanError::ChunkIdGap {
                expected,
                found: chunk.id,
            });
        }
        self.push(&mut table, chunk)
    }

    fn push(&self, table: &mut ChunkTable, chunk: Chunk) -> MemPlanResult<()> {
        if table.completed {
            return Err(MemPlanError::InvalidState {
                expected: "open chunk stream",
                found: "completed chunk stream",
            });
        }
        if table.chunks.len() >= self.capacity {
            return Err(MemPlanError::ChunkTableFull {
                capacity: self.capacity,
            });
        }
        table.chunks.push(Arc::new(chunk));
        self.published.notify_all();
        Ok(())
    }

    /// Blocks until chunk `index` is published, `None` once the stream ended before it.
    pub fn await_chunk(&self, index: usize) -> Option<Arc<Chunk>> {
        let mut table = self.lock();
        while index >= table.chunks.len() && !table.completed {
            table = self
                .published
                .wait(table)
                .unwrap_or_else(|e| e.into_inner());
        }
        table.chunks.get(index).cloned()
    }

    /// Ends the stream. Calling it again has no effect.
    pub fn mark_complete(&self) {
        let mut table = self.lock();
        if !table.completed {
            table.completed = true;
            self.published.notify_all();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.lock().completed
    }

    pub fn len(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of records published so far.
    pub fn events(&self) -> usize {
        self.lock().chunks.iter().map(|chunk| chunk.len()).sum()
    }

    /// Drops every chunk, used once all consumers are done with the stream.
    pub fn clear(&self) {
        self.lock().chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::RAM_ADDR;
    use std::{thread, time::Duration};

    #[test]
    fn test_publish_and_await() {
        let buffer = Arc::new(ChunkBuffer::new(8));
        let reader = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut ids = vec![];
                let mut index = 0;
                while let Some(chunk) = buffer.await_chunk(index) {
                    ids.push(chunk.id);
                    index += 1;
                }
                ids
            })
        };

        for i in 0..3 {
            assert_eq!(buffer.add(vec![MemBusData::read(RAM_ADDR, 8)]).unwrap(), i);
            thread::sleep(Duration::from_millis(2));
        }
        buffer.mark_complete();
        buffer.mark_complete();

        assert_eq!(reader.join().unwrap(), vec![0, 1, 2]);
        // fan-out: a late reader still sees everything, and never blocks past the end
        assert_eq!(buffer.await_chunk(1).unwrap().id, 1);
        assert!(buffer.await_chunk(3).is_none());
        assert!(buffer.await_chunk(100).is_none());
        assert_eq!(buffer.events(), 3);
    }

    #[test]
    fn test_capacity_and_gaps() {
        let buffer = ChunkBuffer::new(2);
        buffer.publish(Chunk::new(0, vec![])).unwrap();
        assert!(matches!(
            buffer.publish(Chunk::new(2, vec![])),
            Err(MemPlanError::ChunkIdGap {
                expected: 1,
                found: 2
            })
        ));
        buffer.add(vec![]).unwrap();
        assert!(matches!(
            buffer.add(vec![]),
            Err(MemPlanError::ChunkTableFull { capacity: 2 })
        ));

        buffer.mark_complete();
        assert!(matches!(
            buffer.add(vec![]),
            Err(MemPlanError::InvalidState { .. })
        ));
    }
}
