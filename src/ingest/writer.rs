//! Batch writer
//!
//! Three flushes per batch, in this order:
//! 1. participants (+ name history): upsert, overwriting power and high-water mark
//! 2. character stats: sorted by key, chunked, additive upsert, retried on conflict
//! 3. matches: insert-or-ignore; failures are logged and swallowed
//!
//! Each character-stat chunk is its own transaction, so a retried chunk is
//! applied at most once and chunks committed before a failure stay committed
//! with their pending deltas cleared.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::accumulator::BatchDelta;
use super::filter::ExistenceFilter;
use crate::config::WriterConfig;
use crate::models::{CharacterStat, Match, NameHistoryEntry, ParticipantProfile, PendingDelta};
use crate::storage::{MatchStore, StoreResult};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub profiles: usize,
    pub names: usize,
    pub character_stats: usize,
    pub chunks: usize,
    pub conflict_retries: u32,
    pub matches_inserted: usize,
}

pub struct BatchWriter {
    store: Arc<dyn MatchStore>,
    filter: Arc<dyn ExistenceFilter>,
    config: WriterConfig,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn MatchStore>,
        filter: Arc<dyn ExistenceFilter>,
        config: WriterConfig,
    ) -> Self {
        Self {
            store,
            filter,
            config,
        }
    }

    /// Flushes a whole batch. Participant and character-stat failures are
    /// returned; match-insert failures are not.
    pub async fn flush(&self, delta: BatchDelta, matches: &[Match]) -> Result<FlushReport> {
        let BatchDelta {
            profiles,
            mut character_stats,
            names,
        } = delta;

        let mut report = FlushReport::default();
        if profiles.is_empty() {
            warn!("Updated participant set is empty! (batch already existed in storage)");
        } else {
            report.conflict_retries += self.flush_participants(&profiles, &names).await?;
            report.profiles = profiles.len();
            report.names = names.len();
        }

        let (chunks, retries) = self.flush_character_stats(&mut character_stats).await?;
        report.character_stats = character_stats.len();
        report.chunks = chunks;
        report.conflict_retries += retries;

        report.matches_inserted = self.flush_matches(matches).await;
        Ok(report)
    }

    /// Returns the number of conflict retries that were needed
    pub async fn flush_participants(
        &self,
        profiles: &[ParticipantProfile],
        names: &[NameHistoryEntry],
    ) -> Result<u32> {
        let start = Instant::now();
        let store = &self.store;
        let retries = self
            .retry_on_conflict("participant upsert", move || {
                store.upsert_participants(profiles, names)
            })
            .await?;
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            participants = profiles.len(),
            names = names.len(),
            "Participant bulk upsert"
        );
        Ok(retries)
    }

    /// Sorts `stats` by (participant, character), then writes them chunk by
    /// chunk. Pending deltas are zeroed on every chunk that commits.
    /// Returns (chunks written, conflict retries).
    pub async fn flush_character_stats(&self, stats: &mut [CharacterStat]) -> Result<(usize, u32)> {
        if stats.is_empty() {
            return Ok((0, 0));
        }
        let start = Instant::now();

        // consistent lock order across concurrent workers
        stats.sort_by(|a, b| {
            (&a.participant_id, a.character_id).cmp(&(&b.participant_id, b.character_id))
        });

        let chunk_size = self.config.chunk_size.max(1);
        let total_chunks = stats.len().div_ceil(chunk_size);
        let mut retries = 0u32;

        for (i, chunk) in stats.chunks_mut(chunk_size).enumerate() {
            {
                let store = &self.store;
                let rows: &[CharacterStat] = chunk;
                retries += self
                    .retry_on_conflict("character_stats upsert", move || {
                        store.upsert_character_stats(rows)
                    })
                    .await
                    .map_err(|e| e.context(format!("chunk {}/{}", i + 1, total_chunks)))?;
            }
            for s in chunk.iter_mut() {
                s.pending = PendingDelta::default();
            }
        }

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            character_stats = stats.len(),
            chunks = total_chunks,
            retries,
            "CharacterStats bulk upsert"
        );
        Ok((total_chunks, retries))
    }

    /// Insert-or-ignore. Errors are logged and swallowed; the filter only
    /// learns ids that made it to storage.
    pub async fn flush_matches(&self, matches: &[Match]) -> usize {
        if matches.is_empty() {
            warn!("No matches to insert.");
            return 0;
        }
        let start = Instant::now();
        match self.store.insert_matches(matches).await {
            Ok(inserted) => {
                for m in matches {
                    self.filter.add(&m.match_id);
                }
                info!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    inserted,
                    submitted = matches.len(),
                    "Match insertion"
                );
                inserted
            }
            Err(e) => {
                error!(error = %e, submitted = matches.len(), "MATCH INSERTION FAILED");
                0
            }
        }
    }

    /// Runs `op` until it succeeds, fails with a non-conflict error, or
    /// `max_attempts` is used up. Returns how many retries were needed.
    async fn retry_on_conflict<F, Fut>(&self, operation: &str, mut op: F) -> Result<u32>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<()>>,
    {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(()) => return Ok(attempt - 1),
                Err(e) if e.is_conflict() && attempt < max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Storage conflict detected. Retrying..."
                    );
                    tokio::time::sleep(policy.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) if e.is_conflict() => {
                    return Err(anyhow!(
                        "{} failed after {} attempts due to storage conflicts: {}",
                        operation,
                        max_attempts,
                        e
                    ));
                }
                Err(e) => return Err(anyhow::Error::new(e).context(operation.to_string())),
            }
        }
    }
}
