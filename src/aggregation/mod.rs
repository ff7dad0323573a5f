pub mod engine;
pub mod rollup;

pub use engine::{AggregationEngine, CycleReport};
