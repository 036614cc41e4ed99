use crate::{
    arena::ChainPos,
    error::{MemPlanError, MemPlanResult},
};
use crossbeam::utils::Backoff;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        OnceLock,
    },
    thread,
    time::Duration,
};

const MAX_CLAIM_SLEEP: Duration = Duration::from_millis(1);

/// Where a RAM segment starts: an entry of one shard's tally chain and the accesses of that
/// entry already placed in the previous segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    pub shard: usize,
    pub offset: u32,
    pub pos: ChainPos,
    pub skip: u32,
}

/// Append-only log of locators written by the discovery pass and claimed by the
/// reconstruction workers. The claim index of a locator is the id of its segment.
pub struct LocatorChannel {
    slots: Box<[OnceLock<Locator>]>,
    published: AtomicUsize,
    claimed: AtomicUsize,
    completed: AtomicBool,
}

/// Marks its channel complete on drop.
pub struct CompletionGuard<'a> {
    channel: &'a LocatorChannel,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.channel.mark_complete();
    }
}

impl LocatorChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| OnceLock::new()).collect(),
            published: AtomicUsize::new(0),
            claimed: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
        }
    }

    /// Appends a locator. Only the discovery thread publishes.
    pub fn publish(&self, locator: Locator) -> MemPlanResult<()> {
        let index = self.published.load(Ordering::Relaxed);
        let slot = self
            .slots
            .get(index)
            .ok_or(MemPlanError::LocatorChannelFull {
                capacity: self.slots.len(),
            })?;
        if slot.set(locator).is_err() {
            return Err(MemPlanError::InvalidState {
                expected: "single locator publisher",
                found: "concurrent publishers",
            });
        }
        self.published.store(index + 1, Ordering::Release);
        Ok(())
    }

    /// No more locators will be published.
    pub fn mark_complete(&self) {
        self.completed.store(true, Ordering::Release);
    }

    /// Completes the channel when the returned guard drops, also while unwinding.
    pub fn completion_guard(&self) -> CompletionGuard<'_> {
        CompletionGuard { channel: self }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Claims the next locator, returning it with its segment id.
    ///
    /// When the claimed index is not published yet the caller spins, then sleeps with a doubling
    /// delay capped at one millisecond, until the locator shows up or the channel completes.
    pub fn claim_next(&self) -> Option<(u32, Locator)> {
        let index = self.claimed.fetch_add(1, Ordering::AcqRel);
        if index >= self.slots.len() {
            return None;
        }
        let backoff = Backoff::new();
        let mut sleep = Duration::from_micros(10);
        loop {
            if index < self.published.load(Ordering::Acquire) {
                return self.slots[index].get().map(|locator| (index as u32, *locator));
            }
            // the last locator may land between the two loads
            if self.is_complete() && index >= self.published.load(Ordering::Acquire) {
                return None;
            }
            if backoff.is_completed() {
                thread::sleep(sleep);
                sleep = (sleep * 2).min(MAX_CLAIM_SLEEP);
            } else {
                backoff.snooze();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.published.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{BlockHandle, SlotArena};
    use std::sync::Arc;

    fn pos() -> ChainPos {
        let mut arena = SlotArena::new(1);
        let block: BlockHandle = arena.alloc_block().unwrap();
        ChainPos { block, slot: 0 }
    }

    #[test]
    fn test_claim_in_order() {
        let channel = LocatorChannel::new(4);
        for i in 0..3 {
            channel
                .publish(Locator {
                    shard: i,
                    offset: i as u32,
                    pos: pos(),
                    skip: 0,
                })
                .unwrap();
        }
        channel.mark_complete();
        let claimed: Vec<_> = std::iter::from_fn(|| channel.claim_next())
            .map(|(id, locator)| (id, locator.shard))
            .collect();
        assert_eq!(claimed, vec![(0, 0), (1, 1), (2, 2)]);
        assert!(channel.claim_next().is_none());
    }

    #[test]
    fn test_capacity() {
        let channel = LocatorChannel::new(1);
        let locator = Locator {
            shard: 0,
            offset: 0,
            pos: pos(),
            skip: 0,
        };
        channel.publish(locator).unwrap();
        assert!(matches!(
            channel.publish(locator),
            Err(MemPlanError::LocatorChannelFull { capacity: 1 })
        ));
    }

    #[test]
    fn test_claim_waits_for_publisher() {
        let channel = Arc::new(LocatorChannel::new(64));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let channel = channel.clone();
                std::thread::spawn(move || {
                    let mut ids = vec![];
                    while let Some((id, locator)) = channel.claim_next() {
                        assert_eq!(locator.offset, id * 10);
                        ids.push(id);
                    }
                    ids
                })
            })
            .collect();

        for i in 0..40u32 {
            channel
                .publish(Locator {
                    shard: 0,
                    offset: i * 10,
                    pos: pos(),
                    skip: i,
                })
                .unwrap();
            if i % 8 == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        channel.mark_complete();

        let mut ids: Vec<u32> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_guard_completes_on_panic() {
        let channel = LocatorChannel::new(8);
        std::thread::scope(|s| {
            let worker = s.spawn(|| std::iter::from_fn(|| channel.claim_next()).count());
            let publisher = s.spawn(|| {
                let _guard = channel.completion_guard();
                channel
                    .publish(Locator {
                        shard: 0,
                        offset: 0,
                        pos: pos(),
                        skip: 0,
                    })
                    .unwrap();
                panic!("publisher failed");
            });
            assert!(publisher.join().is_err());
            assert_eq!(worker.join().unwrap(), 1);
        });
        assert!(channel.is_complete());
    }
}
