//! End-to-end ingestion and aggregation against an in-memory SQLite store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use rankstats_backend::aggregation::AggregationEngine;
use rankstats_backend::config::{PipelineConfig, RetryPolicy};
use rankstats_backend::ingest::{BloomFilter, ExistenceFilter, IngestError, IngestPipeline};
use rankstats_backend::models::{
    AggregatedStatistic, Category, CharacterStat, CharacterStatRow, Match, NameHistoryEntry,
    ParticipantProfile, PendingDelta,
};
use rankstats_backend::storage::{MatchStore, SqliteStore, StoreError, StoreResult};

fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.writer.retry = RetryPolicy {
        max_attempts: 3,
        base_backoff: Duration::from_millis(1),
    };
    config
}

fn game(id: &str, at: i64, p1: &str, p2: &str, winner: u8) -> String {
    format!(
        r#"{{"battle_id": "{id}", "battle_at": {at}, "battle_type": 2, "game_version": 10901,
            "p1_chara_id": 8, "p1_name": "{p1}-name", "p1_polaris_id": "pol-{p1}",
            "p1_power": {p1_power}, "p1_rank": {p1_rank}, "p1_rounds": 3, "p1_user_id": "{p1}",
            "p2_chara_id": 11, "p2_name": "{p2}-name", "p2_polaris_id": "pol-{p2}",
            "p2_power": 500, "p2_rank": 12, "p2_rounds": 1, "p2_user_id": "{p2}",
            "stage_id": 1, "winner": {winner}}}"#,
        p1_power = at * 10,
        p1_rank = at / 100,
    )
}

fn batch(games: &[String]) -> String {
    format!("[{}]", games.join(","))
}

struct Harness {
    store: Arc<SqliteStore>,
    filter: Arc<BloomFilter>,
    pipeline: IngestPipeline,
}

fn harness() -> Harness {
    let store = Arc::new(SqliteStore::new(":memory:").expect("store"));
    let filter = Arc::new(BloomFilter::new(10_000, 0.001));
    let pipeline = IngestPipeline::new(store.clone(), filter.clone(), &fast_config());
    Harness {
        store,
        filter,
        pipeline,
    }
}

fn wins_losses(store: &SqliteStore, pid: &str, cid: i32) -> (i64, i64) {
    let s = store
        .get_character_stat(pid, cid)
        .expect("query")
        .expect("stat present");
    (s.wins, s.losses)
}

#[tokio::test]
async fn same_batch_twice_is_counted_once() {
    let h = harness();
    let payload = batch(&[
        game("m1", 100, "A", "B", 1),
        game("m2", 200, "A", "B", 2),
        game("m3", 300, "C", "B", 1),
    ]);

    let first = h.pipeline.handle_delivery(&payload, "t0").await.expect("first");
    assert_eq!(first.new_matches, 3);

    let second = h.pipeline.handle_delivery(&payload, "t1").await.expect("second");
    assert!(second.authoritative_lookup);
    assert_eq!(second.new_matches, 0);
    assert_eq!(second.duplicates, 3);
    assert!(second.flush.is_none());

    assert_eq!(h.store.match_count(), 3);
    assert_eq!(wins_losses(&h.store, "A", 8), (1, 1));
    assert_eq!(wins_losses(&h.store, "B", 11), (1, 2));
    assert_eq!(wins_losses(&h.store, "C", 8), (1, 0));
}

#[tokio::test]
async fn resubmitted_id_in_same_batch_counts_once() {
    let h = harness();
    let m1 = game("M1", 100, "A", "B", 1);
    let report = h
        .pipeline
        .handle_delivery(&batch(&[m1.clone(), m1]), "t0")
        .await
        .expect("process");

    assert_eq!(report.in_batch_repeats, 1);
    assert_eq!(h.store.match_count(), 1);
    assert_eq!(wins_losses(&h.store, "A", 8), (1, 0));
    assert_eq!(wins_losses(&h.store, "B", 11), (0, 1));
}

#[tokio::test]
async fn older_match_in_later_batch_keeps_newer_rank_and_power() {
    let h = harness();
    h.pipeline
        .handle_delivery(&batch(&[game("new", 900, "A", "B", 1)]), "t0")
        .await
        .expect("newer");
    h.pipeline
        .handle_delivery(&batch(&[game("old", 300, "A", "B", 2)]), "t1")
        .await
        .expect("older");

    let a = h.store.get_character_stat("A", 8).expect("query").expect("stat");
    assert_eq!((a.wins, a.losses), (1, 1));
    assert_eq!(a.rank, 9);
    assert_eq!(a.latest_match_at, 900);

    let profile = h.store.get_participant("A").expect("query").expect("profile");
    assert_eq!(profile.power, 9000);
    assert_eq!(profile.latest_match_at, 900);
}

#[tokio::test]
async fn concurrent_batches_add_up() {
    let h = Arc::new(harness());
    let mut tasks = Vec::new();
    for i in 0..8 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            let games: Vec<String> = (0..5)
                .map(|j| game(&format!("c{}-{}", i, j), 100 + j, "A", "B", 1))
                .collect();
            h.pipeline
                .handle_delivery(&batch(&games), "t")
                .await
                .expect("batch");
        }));
    }
    for t in tasks {
        t.await.expect("join");
    }

    assert_eq!(h.store.match_count(), 40);
    assert_eq!(wins_losses(&h.store, "A", 8), (40, 0));
    assert_eq!(wins_losses(&h.store, "B", 11), (0, 40));
}

#[tokio::test]
async fn filter_threshold_decides_storage_lookup() {
    let h = harness();
    let games: Vec<String> = (0..10)
        .map(|i| game(&format!("g{}", i), 100 + i, "A", "B", 1))
        .collect();

    // mostly seen: 6 of 10 stored and known to the filter
    h.pipeline
        .handle_delivery(&batch(&games[..6]), "t0")
        .await
        .expect("seed");
    let report = h.pipeline.handle_delivery(&batch(&games), "t1").await.expect("mixed");
    assert!(report.authoritative_lookup);
    assert_eq!(report.duplicates, 6);
    assert_eq!(report.new_matches, 4);

    // mostly unseen: 4 of 10 only in the filter, never looked up
    let h = harness();
    let fresh: Vec<String> = (0..10)
        .map(|i| game(&format!("f{}", i), 100 + i, "A", "B", 1))
        .collect();
    for i in 0..4 {
        h.filter.add(&format!("f{}", i));
    }
    let report = h.pipeline.handle_delivery(&batch(&fresh), "t2").await.expect("fresh");
    assert!(!report.authoritative_lookup);
    assert_eq!(report.new_matches, 10);
    assert!(report.unconfirmed_positives >= 4);
    assert_eq!(h.store.match_count(), 10);
}

#[tokio::test]
async fn malformed_delivery_is_rejected_without_writes() {
    let h = harness();
    let bad = format!("[{}, {{\"battle_id\": 5}}]", game("ok", 100, "A", "B", 1));
    let err = h.pipeline.handle_delivery(&bad, "t0").await.unwrap_err();
    assert!(matches!(err, IngestError::Malformed(_)));
    assert!(!err.is_retryable());
    assert_eq!(h.store.match_count(), 0);
}

/// Delegates to SQLite but fails selected operations on demand
struct FlakyStore {
    inner: SqliteStore,
    conflicts_left: AtomicU32,
    fatal: bool,
    stat_calls: AtomicU32,
    fail_insert: bool,
    failing_version: Option<i32>,
}

impl FlakyStore {
    fn new(conflicts: u32, fatal: bool) -> Self {
        Self {
            inner: SqliteStore::new(":memory:").expect("store"),
            conflicts_left: AtomicU32::new(conflicts),
            fatal,
            stat_calls: AtomicU32::new(0),
            fail_insert: false,
            failing_version: None,
        }
    }
}

#[async_trait]
impl MatchStore for FlakyStore {
    async fn all_match_ids(&self) -> StoreResult<Vec<String>> {
        self.inner.all_match_ids().await
    }

    async fn recent_match_ids(&self, limit: usize) -> StoreResult<HashSet<String>> {
        self.inner.recent_match_ids(limit).await
    }

    async fn insert_matches(&self, matches: &[Match]) -> StoreResult<usize> {
        if self.fail_insert {
            return Err(StoreError::Backend(anyhow!("matches table unavailable")));
        }
        self.inner.insert_matches(matches).await
    }

    async fn load_participants(&self, ids: &[String]) -> StoreResult<Vec<ParticipantProfile>> {
        self.inner.load_participants(ids).await
    }

    async fn load_character_stats(&self, ids: &[String]) -> StoreResult<Vec<CharacterStat>> {
        self.inner.load_character_stats(ids).await
    }

    async fn upsert_participants(
        &self,
        profiles: &[ParticipantProfile],
        names: &[NameHistoryEntry],
    ) -> StoreResult<()> {
        self.inner.upsert_participants(profiles, names).await
    }

    async fn upsert_character_stats(&self, chunk: &[CharacterStat]) -> StoreResult<()> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            return Err(StoreError::Backend(anyhow!("disk I/O error")));
        }
        let injected = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Conflict("simulated deadlock".to_string()));
        }
        self.inner.upsert_character_stats(chunk).await
    }

    async fn game_versions(&self) -> StoreResult<Vec<i32>> {
        self.inner.game_versions().await
    }

    async fn character_stats_for_version(&self, v: i32) -> StoreResult<Vec<CharacterStatRow>> {
        if self.failing_version == Some(v) {
            return Err(StoreError::Backend(anyhow!("corrupt page in version {}", v)));
        }
        self.inner.character_stats_for_version(v).await
    }

    async fn aggregated_statistics(
        &self,
        v: i32,
        category: Category,
    ) -> StoreResult<Vec<AggregatedStatistic>> {
        self.inner.aggregated_statistics(v, category).await
    }

    async fn upsert_aggregated_statistics(&self, rows: &[AggregatedStatistic]) -> StoreResult<()> {
        self.inner.upsert_aggregated_statistics(rows).await
    }
}

fn flaky_pipeline(store: Arc<FlakyStore>) -> IngestPipeline {
    let filter = Arc::new(BloomFilter::new(1000, 0.01));
    IngestPipeline::new(store, filter, &fast_config())
}

#[tokio::test]
async fn two_conflicts_then_success_applies_once() {
    let store = Arc::new(FlakyStore::new(2, false));
    let pipeline = flaky_pipeline(store.clone());

    let report = pipeline
        .handle_delivery(&batch(&[game("m1", 100, "A", "B", 1)]), "t0")
        .await
        .expect("third attempt succeeds");

    assert_eq!(store.stat_calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.flush.expect("flushed").conflict_retries, 2);
    assert_eq!(wins_losses(&store.inner, "A", 8), (1, 0));
    assert_eq!(wins_losses(&store.inner, "B", 11), (0, 1));
}

#[tokio::test]
async fn exhausted_conflict_retries_fail_the_batch() {
    let store = Arc::new(FlakyStore::new(3, false));
    let pipeline = flaky_pipeline(store.clone());

    let err = pipeline
        .handle_delivery(&batch(&[game("m1", 100, "A", "B", 1)]), "t0")
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(store.stat_calls.load(Ordering::SeqCst), 3);
    assert!(store.inner.get_character_stat("A", 8).expect("query").is_none());
    // stats failed before the match flush, so the match is not stored either
    assert_eq!(store.inner.match_count(), 0);
}

#[tokio::test]
async fn non_conflict_error_is_not_retried() {
    let store = Arc::new(FlakyStore::new(0, true));
    let pipeline = flaky_pipeline(store.clone());

    let err = pipeline
        .handle_delivery(&batch(&[game("m1", 100, "A", "B", 1)]), "t0")
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Failed(_)));
    assert_eq!(store.stat_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_match_insert_is_swallowed_and_stats_still_apply() {
    let mut store = FlakyStore::new(0, false);
    store.fail_insert = true;
    let store = Arc::new(store);
    let filter = Arc::new(BloomFilter::new(1000, 0.001));
    let pipeline = IngestPipeline::new(store.clone(), filter.clone(), &fast_config());

    let report = pipeline
        .handle_delivery(&batch(&[game("lost", 100, "A", "B", 1)]), "t0")
        .await
        .expect("insert failure does not fail the delivery");

    assert_eq!(report.flush.expect("flushed").matches_inserted, 0);
    assert!(!filter.might_contain("lost"));
    assert_eq!(store.inner.match_count(), 0);
    assert_eq!(wins_losses(&store.inner, "A", 8), (1, 0));
    assert_eq!(wins_losses(&store.inner, "B", 11), (0, 1));
}

#[tokio::test]
async fn failing_version_is_skipped_and_others_still_aggregate() {
    let mut store = FlakyStore::new(0, false);
    store.failing_version = Some(1);
    for (pid, cid, version) in [("A", 1, 1), ("A", 2, 2), ("B", 3, 2)] {
        let mut stat = CharacterStat::new(pid, cid);
        stat.absorb(10, version, 100);
        stat.pending = PendingDelta { wins: 2, losses: 1 };
        store
            .inner
            .upsert_character_stats(&[stat])
            .await
            .expect("seed");
    }
    let store = Arc::new(store);

    let engine = AggregationEngine::new(store.clone(), Duration::from_secs(60));
    let report = engine.run_cycle_at(500).await.expect("cycle still completes");

    assert_eq!(report.versions, 2);
    assert_eq!(report.failed_versions, vec![1]);
    assert_eq!(report.rows_written, 4);

    let v2 = store
        .inner
        .aggregated_statistics(2, Category::Overall)
        .await
        .expect("read v2");
    assert_eq!(v2.len(), 2);
    let v1 = store
        .inner
        .aggregated_statistics(1, Category::Overall)
        .await
        .expect("read v1");
    assert!(v1.is_empty());
}

#[tokio::test]
async fn aggregation_after_ingest_is_deterministic() {
    let h = harness();
    let games: Vec<String> = (0..6)
        .map(|i| {
            let p1 = if i % 2 == 0 { "A" } else { "C" };
            game(&format!("a{}", i), 100 * (i + 1), p1, "B", 1 + (i % 2) as u8)
        })
        .collect();
    h.pipeline
        .handle_delivery(&batch(&games), "t0")
        .await
        .expect("ingest");

    let engine = AggregationEngine::new(h.store.clone(), Duration::from_secs(60));
    let first = engine.run_cycle_at(5_000).await.expect("first cycle");
    let snapshot = |store: Arc<SqliteStore>| async move {
        let mut rows = Vec::new();
        for c in Category::ALL {
            rows.extend(store.aggregated_statistics(10901, c).await.expect("read"));
        }
        serde_json::to_string(&rows).expect("serialize")
    };
    let a = snapshot(h.store.clone()).await;

    let second = engine.run_cycle_at(5_000).await.expect("second cycle");
    let b = snapshot(h.store.clone()).await;

    assert_eq!(first, second);
    assert_eq!(a, b);
    assert!(!a.is_empty());
}
