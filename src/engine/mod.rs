//! Core engine: the aggregate → classify → persist → resolve → diversity →
//! notify cycle and its stages.

pub mod aggregator;
pub mod cycle;
pub mod diversity;
pub mod notifier;
pub mod resolver;

pub use cycle::{CycleLock, CycleReport, Pipeline};
