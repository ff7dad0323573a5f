//! In-process delivery queue and ingestion worker pool.
//!
//! Workers share one receiver. A delivery that fails for a retryable reason
//! is redelivered to the same worker up to `max_redeliveries` times;
//! malformed deliveries are rejected immediately.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::pipeline::IngestPipeline;
use crate::config::QueueConfig;

const REDELIVERY_DELAY: Duration = Duration::from_millis(250);

/// One queue message: a serialized batch plus its transport timestamp
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: String,
    pub delivered_at: String,
}

impl Delivery {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            delivered_at: Utc::now().timestamp().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub processed: u64,
    pub rejected: u64,
    pub failed: u64,
    pub redeliveries: u64,
}

impl WorkerSummary {
    pub fn merge(self, other: WorkerSummary) -> WorkerSummary {
        WorkerSummary {
            processed: self.processed + other.processed,
            rejected: self.rejected + other.rejected,
            failed: self.failed + other.failed,
            redeliveries: self.redeliveries + other.redeliveries,
        }
    }
}

pub fn delivery_channel(
    config: &QueueConfig,
) -> (mpsc::Sender<Delivery>, mpsc::Receiver<Delivery>) {
    mpsc::channel(config.capacity.max(1))
}

/// Spawns `config.workers` consumers. Each handle resolves once the channel
/// is closed and drained.
pub fn spawn_workers(
    pipeline: Arc<IngestPipeline>,
    rx: mpsc::Receiver<Delivery>,
    config: &QueueConfig,
) -> Vec<JoinHandle<WorkerSummary>> {
    let shared_rx = Arc::new(Mutex::new(rx));
    let workers = config.workers.max(1);
    let max_redeliveries = config.max_redeliveries;

    (0..workers)
        .map(|worker| {
            let pipeline = pipeline.clone();
            let rx = shared_rx.clone();
            tokio::spawn(async move {
                let mut summary = WorkerSummary::default();
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(delivery) = next else {
                        break;
                    };
                    consume(worker, &pipeline, &delivery, max_redeliveries, &mut summary).await;
                }
                info!(worker, ?summary, "Ingestion worker stopped");
                summary
            })
        })
        .collect()
}

async fn consume(
    worker: usize,
    pipeline: &IngestPipeline,
    delivery: &Delivery,
    max_redeliveries: u32,
    summary: &mut WorkerSummary,
) {
    debug!(worker, delivered_at = %delivery.delivered_at, "Delivery picked up");
    let mut attempt = 0u32;
    loop {
        match pipeline
            .handle_delivery(&delivery.payload, &delivery.delivered_at)
            .await
        {
            Ok(_) => {
                summary.processed += 1;
                return;
            }
            Err(e) if !e.is_retryable() => {
                warn!(worker, error = %e, "Rejecting delivery");
                summary.rejected += 1;
                return;
            }
            Err(e) if attempt < max_redeliveries => {
                attempt += 1;
                summary.redeliveries += 1;
                warn!(
                    worker,
                    attempt,
                    max_redeliveries,
                    error = %e,
                    "Delivery failed, redelivering"
                );
                tokio::time::sleep(REDELIVERY_DELAY).await;
            }
            Err(e) => {
                error!(worker, error = %e, "Delivery failed, giving up");
                summary.failed += 1;
                return;
            }
        }
    }
}
