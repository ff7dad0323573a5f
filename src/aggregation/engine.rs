//! Scheduled aggregation engine

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use super::rollup;
use crate::models::Category;
use crate::storage::MatchStore;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub versions: usize,
    pub rows_written: usize,
    pub failed_versions: Vec<i32>,
}

pub struct AggregationEngine {
    store: Arc<dyn MatchStore>,
    period: Duration,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn MatchStore>, period: Duration) -> Self {
        Self { store, period }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now().timestamp()).await
    }

    /// One full pass over every game version. A failing version is logged
    /// and skipped; only listing the versions can fail the whole cycle.
    pub async fn run_cycle_at(&self, computed_at: i64) -> Result<CycleReport> {
        let start = Instant::now();
        let versions = self
            .store
            .game_versions()
            .await
            .context("listing game versions")?;

        let mut report = CycleReport {
            versions: versions.len(),
            ..Default::default()
        };

        for version in versions {
            match self.aggregate_version(version, computed_at).await {
                Ok(rows) => report.rows_written += rows,
                Err(e) => {
                    let error = format!("{:#}", e);
                    error!(
                        game_version = version,
                        %error,
                        "Aggregation failed for version, skipping"
                    );
                    report.failed_versions.push(version);
                }
            }
        }

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            versions = report.versions,
            rows = report.rows_written,
            failed = report.failed_versions.len(),
            "📊 Aggregation cycle complete"
        );
        Ok(report)
    }

    async fn aggregate_version(&self, version: i32, computed_at: i64) -> Result<usize> {
        let rows = self
            .store
            .character_stats_for_version(version)
            .await
            .with_context(|| format!("reading character stats for {}", version))?;

        let mut written = 0;
        for category in Category::ALL {
            let existing = self
                .store
                .aggregated_statistics(version, category)
                .await
                .with_context(|| format!("reading {} aggregates", category.as_str()))?;
            let selection = rollup::select(&rows, category);
            let out = rollup::aggregate(&selection, version, category, existing, computed_at);
            self.store
                .upsert_aggregated_statistics(&out)
                .await
                .with_context(|| format!("writing {} aggregates", category.as_str()))?;
            written += out.len();
        }
        Ok(written)
    }

    /// Ticks every `period`. Cycles run inline on one task, so a slow cycle
    /// delays the next tick instead of overlapping it.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period_secs = self.period.as_secs(), "Aggregation engine started");

            loop {
                ticker.tick().await;
                if let Err(e) = self.run_cycle().await {
                    let error = format!("{:#}", e);
                    error!(%error, "Aggregation cycle failed");
                }
            }
        })
    }
}
