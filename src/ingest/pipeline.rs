//! Per-delivery orchestration: parse, dedup, accumulate, flush.

use anyhow::Context;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::accumulator::BatchAccumulator;
use super::dedup::BatchDeduplicator;
use super::filter::ExistenceFilter;
use super::writer::{BatchWriter, FlushReport};
use crate::config::PipelineConfig;
use crate::models::{Match, Slot};
use crate::storage::MatchStore;

/// Why a delivery was not processed
#[derive(Debug)]
pub enum IngestError {
    /// Payload could not be parsed or failed validation; redelivery cannot help
    Malformed(String),
    /// Storage or flush failure; the delivery may be retried
    Failed(anyhow::Error),
}

impl IngestError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Failed(_))
    }
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed delivery: {}", msg),
            Self::Failed(e) => write!(f, "batch processing failed: {:#}", e),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<anyhow::Error> for IngestError {
    fn from(err: anyhow::Error) -> Self {
        IngestError::Failed(err)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub received: usize,
    pub new_matches: usize,
    pub duplicates: usize,
    pub in_batch_repeats: usize,
    pub authoritative_lookup: bool,
    pub unconfirmed_positives: usize,
    /// `None` when the whole batch was already stored
    pub flush: Option<FlushReport>,
}

pub struct IngestPipeline {
    store: Arc<dyn MatchStore>,
    dedup: BatchDeduplicator,
    writer: BatchWriter,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn MatchStore>,
        filter: Arc<dyn ExistenceFilter>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            dedup: BatchDeduplicator::new(filter.clone(), store.clone(), config.dedup.clone()),
            writer: BatchWriter::new(store.clone(), filter, config.writer.clone()),
            store,
        }
    }

    /// A delivery is a JSON array of matches. Any invalid element rejects
    /// the whole delivery.
    pub fn parse_delivery(payload: &str) -> Result<Vec<Match>, IngestError> {
        let matches: Vec<Match> = serde_json::from_str(payload)
            .map_err(|e| IngestError::Malformed(format!("invalid match payload: {}", e)))?;
        for m in &matches {
            m.validate().map_err(IngestError::Malformed)?;
        }
        Ok(matches)
    }

    /// `delivered_at` is the transport's side-channel timestamp, logged only
    pub async fn handle_delivery(
        &self,
        payload: &str,
        delivered_at: &str,
    ) -> Result<BatchReport, IngestError> {
        let start = Instant::now();
        info!(delivered_at, "Received match data");

        let matches = Self::parse_delivery(payload)?;
        let report = self.process_matches(matches).await?;

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            received = report.received,
            new = report.new_matches,
            "Total operation time"
        );
        Ok(report)
    }

    pub async fn process_matches(&self, matches: Vec<Match>) -> anyhow::Result<BatchReport> {
        let received = matches.len();
        let outcome = self
            .dedup
            .deduplicate(matches)
            .await
            .context("duplicate check failed")?;

        let mut report = BatchReport {
            received,
            new_matches: outcome.new_matches.len(),
            duplicates: outcome.duplicates,
            in_batch_repeats: outcome.in_batch_repeats,
            authoritative_lookup: outcome.authoritative_lookup,
            unconfirmed_positives: outcome.unconfirmed_positives,
            flush: None,
        };

        if outcome.all_duplicates() {
            if received > 0 {
                warn!(received, "Entire batch already exists in storage!");
            }
            return Ok(report);
        }

        let start = Instant::now();
        let participant_ids: Vec<String> = outcome
            .new_matches
            .iter()
            .flat_map(|m| Slot::BOTH.map(|slot| m.side(slot).participant_id.to_string()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let existing_profiles = self
            .store
            .load_participants(&participant_ids)
            .await
            .context("loading stored participants")?;
        let existing_stats = self
            .store
            .load_character_stats(&participant_ids)
            .await
            .context("loading stored character stats")?;

        let mut acc = BatchAccumulator::with_existing(existing_profiles, existing_stats);
        acc.apply_all(&outcome.new_matches);
        let delta = acc.finish();
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            participants = delta.profiles.len(),
            character_stats = delta.character_stats.len(),
            "Updated participant and match information"
        );

        report.flush = Some(self.writer.flush(delta, &outcome.new_matches).await?);
        Ok(report)
    }
}
