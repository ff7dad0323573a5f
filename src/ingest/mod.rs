//! Match ingestion: filter, dedup, accumulate, flush.

pub mod accumulator;
pub mod dedup;
pub mod filter;
pub mod pipeline;
pub mod queue;
pub mod writer;

pub use accumulator::{BatchAccumulator, BatchDelta};
pub use dedup::{BatchDeduplicator, DedupOutcome};
pub use filter::{BloomFilter, ExistenceFilter};
pub use pipeline::{BatchReport, IngestError, IngestPipeline};
pub use queue::{delivery_channel, spawn_workers, Delivery, WorkerSummary};
pub use writer::{BatchWriter, FlushReport};
