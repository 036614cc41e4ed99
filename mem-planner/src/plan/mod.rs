//! Segment planning over the tallies produced by the address counters.
//!
//! ROM and input are planned densely by a single thread ([`ImmutablePlanner`]). RAM is first
//! walked by a discovery pass that only publishes segment boundaries, which reconstruction
//! workers then turn into segments independently ([`RamPlanner`]).

pub mod immutable;
pub mod locator;
pub mod ram;

pub use immutable::ImmutablePlanner;
pub use locator::{Locator, LocatorChannel};
pub use ram::RamPlanner;

use crate::error::{MemPlanError, MemPlanResult};
use std::thread::ScopedJoinHandle;

/// Joins a scoped worker, turning a panic into an error naming the worker.
pub(crate) fn join_worker<T>(
    handle: ScopedJoinHandle<'_, MemPlanResult<T>>,
    name: impl Into<String>,
) -> MemPlanResult<T> {
    handle
        .join()
        .map_err(|_| MemPlanError::WorkerPanicked(name.into()))?
}
