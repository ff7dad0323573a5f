//! Batch deduplication
//!
//! The existence filter decides whether a batch looks mostly-seen. Only then
//! is storage asked, and only for a bounded window of recent matches. A match
//! older than that window, or any match in a batch that stays under the
//! threshold, is classified as new even if it was stored before. The match
//! row itself is still protected by the insert-or-ignore flush; its stat
//! deltas are not. `unconfirmed_positives` makes that gap visible.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use super::filter::ExistenceFilter;
use crate::config::DedupConfig;
use crate::models::Match;
use crate::storage::{MatchStore, StoreResult};

/// Result of asking the filter about one batch of candidate ids
#[derive(Debug, Clone, PartialEq)]
pub struct FilterProbe {
    /// Candidate ids the filter flagged before probing stopped
    pub positives: Vec<String>,
    /// How many candidates were queried
    pub probed: usize,
    /// `positives / candidates`, where candidates is the full batch size
    pub positive_ratio: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// Matches classified as new, in delivery order, with `date` filled in
    pub new_matches: Vec<Match>,
    /// Matches confirmed present by the storage window
    pub duplicates: usize,
    /// Repeats of an id earlier in the same delivery
    pub in_batch_repeats: usize,
    pub positive_ratio: f64,
    pub authoritative_lookup: bool,
    /// Filter hits the window could not confirm; these were treated as new
    pub unconfirmed_positives: usize,
}

impl DedupOutcome {
    pub fn all_duplicates(&self) -> bool {
        self.new_matches.is_empty()
    }
}

pub struct BatchDeduplicator {
    filter: Arc<dyn ExistenceFilter>,
    store: Arc<dyn MatchStore>,
    config: DedupConfig,
}

impl BatchDeduplicator {
    pub fn new(
        filter: Arc<dyn ExistenceFilter>,
        store: Arc<dyn MatchStore>,
        config: DedupConfig,
    ) -> Self {
        Self {
            filter,
            store,
            config,
        }
    }

    /// Queries the filter, stopping once the positive fraction of the whole
    /// candidate set reaches the threshold.
    pub fn probe_filter(&self, candidates: &[&str]) -> FilterProbe {
        let total = candidates.len();
        if total == 0 {
            return FilterProbe {
                positives: Vec::new(),
                probed: 0,
                positive_ratio: 0.0,
            };
        }

        let mut positives = Vec::new();
        let mut probed = 0usize;
        for id in candidates {
            probed += 1;
            if self.filter.might_contain(id) {
                positives.push(id.to_string());
                if positives.len() as f64 / total as f64 >= self.config.threshold {
                    break;
                }
            }
        }

        FilterProbe {
            positive_ratio: positives.len() as f64 / total as f64,
            positives,
            probed,
        }
    }

    pub async fn deduplicate(&self, batch: Vec<Match>) -> StoreResult<DedupOutcome> {
        let start = Instant::now();
        if batch.is_empty() {
            warn!("No match ids provided. Skipping duplicate check.");
            return Ok(DedupOutcome::default());
        }

        let mut seen_in_batch = HashSet::with_capacity(batch.len());
        let mut unique = Vec::with_capacity(batch.len());
        let mut in_batch_repeats = 0usize;
        for m in batch {
            if seen_in_batch.insert(m.match_id.clone()) {
                unique.push(m);
            } else {
                in_batch_repeats += 1;
            }
        }

        let candidates: Vec<&str> = unique.iter().map(|m| m.match_id.as_str()).collect();
        let probe = self.probe_filter(&candidates);
        info!(
            positive_pct = probe.positive_ratio * 100.0,
            probed = probe.probed,
            candidates = candidates.len(),
            "Positive matches in existence filter"
        );

        let mut outcome = DedupOutcome {
            in_batch_repeats,
            positive_ratio: probe.positive_ratio,
            ..Default::default()
        };

        if probe.positive_ratio < self.config.threshold {
            info!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Batch fell below filter threshold. Skipping storage lookup."
            );
            outcome.unconfirmed_positives = probe.positives.len();
            outcome.new_matches = unique.into_iter().map(Match::annotate).collect();
            self.report_unconfirmed(&outcome);
            return Ok(outcome);
        }

        outcome.authoritative_lookup = true;
        let window = self.store.recent_match_ids(self.config.window).await?;
        info!(
            window = window.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Fetched recent match ids from storage"
        );

        outcome.unconfirmed_positives = probe
            .positives
            .iter()
            .filter(|id| !window.contains(id.as_str()))
            .count();

        for m in unique {
            if window.contains(&m.match_id) {
                outcome.duplicates += 1;
            } else {
                outcome.new_matches.push(m.annotate());
            }
        }
        self.report_unconfirmed(&outcome);
        Ok(outcome)
    }

    fn report_unconfirmed(&self, outcome: &DedupOutcome) {
        if outcome.unconfirmed_positives > 0 {
            warn!(
                unconfirmed = outcome.unconfirmed_positives,
                window = self.config.window,
                lookup = outcome.authoritative_lookup,
                "Filter hits not confirmed by storage window were treated as new"
            );
        }
    }
}
