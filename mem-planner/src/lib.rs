#![allow(clippy::module_inception)]

pub mod align;
pub mod arena;
pub mod bus;
pub mod chunk;
pub mod counter;
pub mod error;
pub mod layout;
pub mod observer;
pub mod opts;
pub mod pipeline;
pub mod plan;
pub mod segment;
pub mod walker;

pub use error::{MemPlanError, MemPlanResult};
pub use layout::MemRegion;
pub use opts::MemPlannerOpts;
pub use pipeline::{MemPipeline, MemProducer, PipelineState};
