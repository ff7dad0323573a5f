//! Rankstats Backend Library
//!
//! Match ingestion (existence filter, dedup, accumulate, flush) and the
//! scheduled population aggregation engine. Used by the `rankstats` binary
//! and the integration tests.

pub mod aggregation;
pub mod config;
pub mod ingest;
pub mod models;
pub mod storage;
