//! Pipeline configuration
//!
//! Every tunable has a default; `from_env` overrides from environment
//! variables and silently keeps the default for unparsable values.

use serde::{Deserialize, Serialize};
use std::{env, str::FromStr, time::Duration};

/// Duplicate detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Filter-positive fraction at which the authoritative lookup runs
    pub threshold: f64,
    /// How many of the most recent stored matches the lookup scans
    pub window: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            window: 250_000,
        }
    }
}

/// Existence filter sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub expected_items: usize,
    pub false_positive_rate: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            expected_items: 1_000_000,
            false_positive_rate: 0.01,
        }
    }
}

/// Retry policy for conflict signals raised by storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per chunk, including the first
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Sleep before retry number `retry` (1-based): base * 2^retry
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << retry.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

/// Batch writer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    pub chunk_size: usize,
    pub retry: RetryPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Delivery queue and worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub workers: usize,
    pub capacity: usize,
    /// Extra deliveries of a failed message before it is dropped
    pub max_redeliveries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 64,
            max_redeliveries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub period: Duration,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub dedup: DedupConfig,
    pub filter: FilterConfig,
    pub writer: WriterConfig,
    pub queue: QueueConfig,
    pub aggregation: AggregationConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let threshold = env_or("DEDUP_THRESHOLD", defaults.dedup.threshold);
        let threshold = if (0.0..=1.0).contains(&threshold) {
            threshold
        } else {
            defaults.dedup.threshold
        };

        Self {
            dedup: DedupConfig {
                threshold,
                window: env_positive("DEDUP_WINDOW", defaults.dedup.window),
            },
            filter: FilterConfig {
                expected_items: env_positive(
                    "FILTER_EXPECTED_ITEMS",
                    defaults.filter.expected_items,
                ),
                false_positive_rate: Some(env_or(
                    "FILTER_FP_RATE",
                    defaults.filter.false_positive_rate,
                ))
                .filter(|&p| p > 0.0 && p < 1.0)
                .unwrap_or(defaults.filter.false_positive_rate),
            },
            writer: WriterConfig {
                chunk_size: env_positive("FLUSH_CHUNK_SIZE", defaults.writer.chunk_size),
                retry: RetryPolicy {
                    max_attempts: env_positive(
                        "FLUSH_MAX_ATTEMPTS",
                        defaults.writer.retry.max_attempts,
                    ),
                    base_backoff: Duration::from_millis(env_or(
                        "FLUSH_BACKOFF_BASE_MS",
                        defaults.writer.retry.base_backoff.as_millis() as u64,
                    )),
                },
            },
            queue: QueueConfig {
                workers: env_positive("INGEST_WORKERS", defaults.queue.workers),
                capacity: env_positive("QUEUE_CAPACITY", defaults.queue.capacity),
                max_redeliveries: env_or("MAX_REDELIVERIES", defaults.queue.max_redeliveries),
            },
            aggregation: AggregationConfig {
                period: Duration::from_secs(env_positive(
                    "AGGREGATION_PERIOD_SECS",
                    defaults.aggregation.period.as_secs(),
                )),
            },
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_positive<T: FromStr + PartialOrd + Default>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v > T::default())
        .unwrap_or(default)
}
