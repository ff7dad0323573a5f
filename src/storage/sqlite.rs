//! SQLite-backed match store
//!
//! Key points:
//! - WAL mode so the aggregation scans do not block ingestion writes
//! - Every write is one IMMEDIATE transaction with cached statements
//! - Upserts use `ON CONFLICT ... DO UPDATE`, additive on win/loss counters

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, TransactionBehavior};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::{MatchStore, StoreResult};
use crate::models::{
    AggregateKey, AggregatedStatistic, Category, CharacterStat, CharacterStatRow, Match,
    NameHistoryEntry, ParticipantProfile, PendingDelta,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;  -- 64MB cache
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS matches (
    match_id TEXT PRIMARY KEY,
    date TEXT NOT NULL,
    played_at INTEGER NOT NULL,
    match_type INTEGER NOT NULL,
    game_version INTEGER NOT NULL,
    p1_character_id INTEGER NOT NULL,
    p1_name TEXT NOT NULL,
    p1_platform_id TEXT NOT NULL,
    p1_power INTEGER NOT NULL,
    p1_rank INTEGER NOT NULL,
    p1_rating_before INTEGER,
    p1_rating_change INTEGER,
    p1_rounds_won INTEGER NOT NULL,
    p1_participant_id TEXT NOT NULL,
    p2_character_id INTEGER NOT NULL,
    p2_name TEXT NOT NULL,
    p2_platform_id TEXT NOT NULL,
    p2_power INTEGER NOT NULL,
    p2_rank INTEGER NOT NULL,
    p2_rating_before INTEGER,
    p2_rating_change INTEGER,
    p2_rounds_won INTEGER NOT NULL,
    p2_participant_id TEXT NOT NULL,
    stage_id INTEGER NOT NULL,
    winner INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_matches_played_at
    ON matches(played_at DESC);

CREATE TABLE IF NOT EXISTS participants (
    participant_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    platform_id TEXT NOT NULL,
    power INTEGER NOT NULL,
    latest_match_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS character_stats (
    participant_id TEXT NOT NULL,
    character_id INTEGER NOT NULL,
    game_version INTEGER NOT NULL,
    rank INTEGER NOT NULL,
    wins INTEGER NOT NULL,
    losses INTEGER NOT NULL,
    latest_match_at INTEGER NOT NULL,
    PRIMARY KEY (participant_id, character_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_character_stats_version
    ON character_stats(game_version, participant_id, character_id);

CREATE TABLE IF NOT EXISTS name_history (
    participant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    PRIMARY KEY (participant_id, name)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS aggregated_statistics (
    game_version INTEGER NOT NULL,
    character_id INTEGER NOT NULL,
    rank INTEGER NOT NULL,
    category TEXT NOT NULL,
    total_wins INTEGER NOT NULL,
    total_losses INTEGER NOT NULL,
    total_players INTEGER NOT NULL,
    total_matches INTEGER NOT NULL,
    computed_at INTEGER NOT NULL,
    PRIMARY KEY (game_version, character_id, rank, category)
) WITHOUT ROWID;
"#;

const INSERT_MATCH_SQL: &str = "INSERT INTO matches (
    match_id, date, played_at, match_type, game_version,
    p1_character_id, p1_name, p1_platform_id, p1_power, p1_rank,
    p1_rating_before, p1_rating_change, p1_rounds_won, p1_participant_id,
    p2_character_id, p2_name, p2_platform_id, p2_power, p2_rank,
    p2_rating_before, p2_rating_change, p2_rounds_won, p2_participant_id,
    stage_id, winner
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
          ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)
ON CONFLICT(match_id) DO NOTHING";

const UPSERT_PARTICIPANT_SQL: &str =
    "INSERT INTO participants (participant_id, name, platform_id, power, latest_match_at)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT(participant_id) DO UPDATE SET
        power = excluded.power,
        latest_match_at = excluded.latest_match_at";

const UPSERT_CHARACTER_STAT_SQL: &str = "INSERT INTO character_stats
     (participant_id, character_id, game_version, rank, wins, losses, latest_match_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(participant_id, character_id) DO UPDATE SET
        game_version = excluded.game_version,
        rank = excluded.rank,
        latest_match_at = excluded.latest_match_at,
        wins = character_stats.wins + excluded.wins,
        losses = character_stats.losses + excluded.losses";

const UPSERT_AGGREGATE_SQL: &str = "INSERT INTO aggregated_statistics
     (game_version, character_id, rank, category,
      total_wins, total_losses, total_players, total_matches, computed_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
     ON CONFLICT(game_version, character_id, rank, category) DO UPDATE SET
        total_wins = excluded.total_wins,
        total_losses = excluded.total_losses,
        total_players = excluded.total_players,
        total_matches = excluded.total_matches,
        computed_at = excluded.computed_at";

/// Keeps `IN (...)` lists well under SQLite's bound-parameter limit
const LOOKUP_CHUNK: usize = 500;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // locking is ours

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.busy_timeout(Duration::from_millis(250))
            .context("Failed to set busy timeout")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        if db_path != ":memory:" {
            let journal_mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .unwrap_or_default();
            if journal_mode.to_lowercase() != "wal" {
                warn!("WAL mode not active, journal_mode = {}", journal_mode);
            }
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM matches", [], |row| row.get(0))
            .unwrap_or(0);
        info!(db_path, existing_matches = count, "📊 Match store initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn match_count(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM matches", [], |row| row.get::<_, i64>(0))
            .map(|c| c as usize)
            .unwrap_or(0)
    }

    pub fn get_match(&self, match_id: &str) -> anyhow::Result<Option<Match>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT match_id, date, played_at, match_type, game_version,
                    p1_character_id, p1_name, p1_platform_id, p1_power, p1_rank,
                    p1_rating_before, p1_rating_change, p1_rounds_won, p1_participant_id,
                    p2_character_id, p2_name, p2_platform_id, p2_power, p2_rank,
                    p2_rating_before, p2_rating_change, p2_rounds_won, p2_participant_id,
                    stage_id, winner
             FROM matches WHERE match_id = ?1",
        )?;
        let mut rows = stmt.query(params![match_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(Match {
            match_id: row.get(0)?,
            date: row.get(1)?,
            played_at: row.get(2)?,
            match_type: row.get(3)?,
            game_version: row.get(4)?,
            p1_character_id: row.get(5)?,
            p1_name: row.get(6)?,
            p1_platform_id: row.get(7)?,
            p1_power: row.get(8)?,
            p1_rank: row.get(9)?,
            p1_rating_before: row.get(10)?,
            p1_rating_change: row.get(11)?,
            p1_rounds_won: row.get(12)?,
            p1_participant_id: row.get(13)?,
            p2_character_id: row.get(14)?,
            p2_name: row.get(15)?,
            p2_platform_id: row.get(16)?,
            p2_power: row.get(17)?,
            p2_rank: row.get(18)?,
            p2_rating_before: row.get(19)?,
            p2_rating_change: row.get(20)?,
            p2_rounds_won: row.get(21)?,
            p2_participant_id: row.get(22)?,
            stage_id: row.get(23)?,
            winner: row.get(24)?,
        }))
    }

    pub fn get_participant(
        &self,
        participant_id: &str,
    ) -> anyhow::Result<Option<ParticipantProfile>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT participant_id, name, platform_id, power, latest_match_at
             FROM participants WHERE participant_id = ?1",
        )?;
        let mut rows = stmt.query(params![participant_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(Self::row_to_profile(row)?))
    }

    pub fn get_character_stat(
        &self,
        participant_id: &str,
        character_id: i32,
    ) -> anyhow::Result<Option<CharacterStat>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT participant_id, character_id, game_version, rank, wins, losses, latest_match_at
             FROM character_stats WHERE participant_id = ?1 AND character_id = ?2",
        )?;
        let mut rows = stmt.query(params![participant_id, character_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(Self::row_to_character_stat(row)?))
    }

    pub fn names_for(&self, participant_id: &str) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT name FROM name_history WHERE participant_id = ?1 ORDER BY name ASC",
        )?;
        let names = stmt
            .query_map(params![participant_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    fn row_to_profile(row: &rusqlite::Row) -> rusqlite::Result<ParticipantProfile> {
        Ok(ParticipantProfile {
            participant_id: row.get(0)?,
            name: row.get(1)?,
            platform_id: row.get(2)?,
            power: row.get(3)?,
            latest_match_at: row.get(4)?,
        })
    }

    fn row_to_character_stat(row: &rusqlite::Row) -> rusqlite::Result<CharacterStat> {
        Ok(CharacterStat {
            participant_id: row.get(0)?,
            character_id: row.get(1)?,
            game_version: row.get(2)?,
            rank: row.get(3)?,
            wins: row.get(4)?,
            losses: row.get(5)?,
            latest_match_at: row.get(6)?,
            pending: PendingDelta::default(),
        })
    }

    fn row_to_aggregate(row: &rusqlite::Row) -> rusqlite::Result<AggregatedStatistic> {
        let category: String = row.get(3)?;
        let category = Category::parse(&category).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown category {category:?}").into(),
            )
        })?;
        Ok(AggregatedStatistic {
            key: AggregateKey {
                game_version: row.get(0)?,
                character_id: row.get(1)?,
                rank: row.get(2)?,
                category,
            },
            total_wins: row.get(4)?,
            total_losses: row.get(5)?,
            total_players: row.get(6)?,
            total_matches: row.get(7)?,
            computed_at: row.get(8)?,
        })
    }

    fn placeholders(n: usize) -> String {
        vec!["?"; n].join(", ")
    }
}

#[async_trait]
impl MatchStore for SqliteStore {
    async fn all_match_ids(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT match_id FROM matches")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    async fn recent_match_ids(&self, limit: usize) -> StoreResult<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT match_id FROM matches ORDER BY played_at DESC LIMIT ?1",
        )?;
        let ids = stmt
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(ids)
    }

    async fn insert_matches(&self, matches: &[Match]) -> StoreResult<usize> {
        if matches.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(INSERT_MATCH_SQL)?;
            for m in matches {
                inserted += stmt.execute(params![
                    &m.match_id,
                    &m.date,
                    m.played_at,
                    m.match_type,
                    m.game_version,
                    m.p1_character_id,
                    &m.p1_name,
                    &m.p1_platform_id,
                    m.p1_power,
                    m.p1_rank,
                    m.p1_rating_before,
                    m.p1_rating_change,
                    m.p1_rounds_won,
                    &m.p1_participant_id,
                    m.p2_character_id,
                    &m.p2_name,
                    &m.p2_platform_id,
                    m.p2_power,
                    m.p2_rank,
                    m.p2_rating_before,
                    m.p2_rating_change,
                    m.p2_rounds_won,
                    &m.p2_participant_id,
                    m.stage_id,
                    m.winner,
                ])?;
            }
        }
        tx.commit()?;
        debug!("📦 Batch inserted {} of {} matches", inserted, matches.len());
        Ok(inserted)
    }

    async fn load_participants(&self, ids: &[String]) -> StoreResult<Vec<ParticipantProfile>> {
        let conn = self.conn.lock();
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let sql = format!(
                "SELECT participant_id, name, platform_id, power, latest_match_at
                 FROM participants WHERE participant_id IN ({})",
                Self::placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), Self::row_to_profile)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    async fn load_character_stats(&self, ids: &[String]) -> StoreResult<Vec<CharacterStat>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let sql = format!(
                "SELECT participant_id, character_id, game_version, rank, wins, losses,
                        latest_match_at
                 FROM character_stats WHERE participant_id IN ({})",
                Self::placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows =
                stmt.query_map(params_from_iter(chunk.iter()), Self::row_to_character_stat)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    async fn upsert_participants(
        &self,
        profiles: &[ParticipantProfile],
        names: &[NameHistoryEntry],
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_PARTICIPANT_SQL)?;
            for p in profiles {
                stmt.execute(params![
                    &p.participant_id,
                    &p.name,
                    &p.platform_id,
                    p.power,
                    p.latest_match_at,
                ])?;
            }
            let mut names_stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO name_history (participant_id, name) VALUES (?1, ?2)",
            )?;
            for entry in names {
                names_stmt.execute(params![&entry.participant_id, &entry.name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn upsert_character_stats(&self, chunk: &[CharacterStat]) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_CHARACTER_STAT_SQL)?;
            for s in chunk {
                stmt.execute(params![
                    &s.participant_id,
                    s.character_id,
                    s.game_version,
                    s.rank,
                    s.pending.wins,
                    s.pending.losses,
                    s.latest_match_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn game_versions(&self) -> StoreResult<Vec<i32>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT game_version FROM character_stats ORDER BY game_version ASC",
        )?;
        let versions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i32>>>()?;
        Ok(versions)
    }

    async fn character_stats_for_version(
        &self,
        game_version: i32,
    ) -> StoreResult<Vec<CharacterStatRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT participant_id, character_id, rank, wins, losses
             FROM character_stats WHERE game_version = ?1
             ORDER BY participant_id ASC, character_id ASC",
        )?;
        let rows = stmt
            .query_map(params![game_version], |row| {
                Ok(CharacterStatRow {
                    participant_id: row.get(0)?,
                    character_id: row.get(1)?,
                    rank: row.get(2)?,
                    wins: row.get(3)?,
                    losses: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn aggregated_statistics(
        &self,
        game_version: i32,
        category: Category,
    ) -> StoreResult<Vec<AggregatedStatistic>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT game_version, character_id, rank, category,
                    total_wins, total_losses, total_players, total_matches, computed_at
             FROM aggregated_statistics WHERE game_version = ?1 AND category = ?2
             ORDER BY character_id ASC, rank ASC",
        )?;
        let rows = stmt
            .query_map(params![game_version, category.as_str()], Self::row_to_aggregate)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn upsert_aggregated_statistics(&self, rows: &[AggregatedStatistic]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_AGGREGATE_SQL)?;
            for r in rows {
                stmt.execute(params![
                    r.key.game_version,
                    r.key.character_id,
                    r.key.rank,
                    r.key.category.as_str(),
                    r.total_wins,
                    r.total_losses,
                    r.total_players,
                    r.total_matches,
                    r.computed_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_match(id: &str, played_at: i64) -> Match {
        Match {
            match_id: id.to_string(),
            date: String::new(),
            played_at,
            match_type: 2,
            game_version: 10901,
            p1_character_id: 8,
            p1_name: "alpha".to_string(),
            p1_platform_id: "pol-a".to_string(),
            p1_power: 100,
            p1_rank: 15,
            p1_rating_before: Some(1500),
            p1_rating_change: Some(10),
            p1_rounds_won: 3,
            p1_participant_id: "A".to_string(),
            p2_character_id: 11,
            p2_name: "bravo".to_string(),
            p2_platform_id: "pol-b".to_string(),
            p2_power: 90,
            p2_rank: 14,
            p2_rating_before: None,
            p2_rating_change: None,
            p2_rounds_won: 1,
            p2_participant_id: "B".to_string(),
            stage_id: 400,
            winner: 1,
        }
        .annotate()
    }

    fn stat_with_delta(pid: &str, cid: i32, wins: i64, losses: i64, at: i64) -> CharacterStat {
        let mut s = CharacterStat::new(pid, cid);
        s.absorb(10, 10901, at);
        s.pending = PendingDelta { wins, losses };
        s
    }

    #[tokio::test]
    async fn test_store_create() {
        let store = SqliteStore::new(":memory:").expect("Failed to create database");
        assert_eq!(store.match_count(), 0);
        assert!(store.game_versions().await.expect("versions").is_empty());
    }

    #[tokio::test]
    async fn test_insert_matches_is_idempotent() {
        let store = SqliteStore::new(":memory:").expect("Failed to create database");
        let batch = vec![create_test_match("m1", 100), create_test_match("m2", 200)];

        let first = store.insert_matches(&batch).await.expect("insert");
        let second = store.insert_matches(&batch).await.expect("insert again");

        assert_eq!(first, 2);
        assert_eq!(second, 0);
        assert_eq!(store.match_count(), 2);

        let stored = store.get_match("m2").expect("get").expect("present");
        assert_eq!(stored, batch[1]);
    }

    #[tokio::test]
    async fn test_recent_match_ids_window() {
        let store = SqliteStore::new(":memory:").expect("Failed to create database");
        let batch: Vec<_> = (0..10)
            .map(|i| create_test_match(&format!("m{}", i), i as i64 * 10))
            .collect();
        store.insert_matches(&batch).await.expect("insert");

        let window = store.recent_match_ids(3).await.expect("window");
        let expected: HashSet<String> = ["m9", "m8", "m7"].iter().map(|s| s.to_string()).collect();
        assert_eq!(window, expected);
    }

    #[tokio::test]
    async fn test_character_stat_upsert_is_additive() {
        let store = SqliteStore::new(":memory:").expect("Failed to create database");

        store
            .upsert_character_stats(&[stat_with_delta("A", 8, 2, 1, 100)])
            .await
            .expect("first");
        store
            .upsert_character_stats(&[stat_with_delta("A", 8, 1, 3, 200)])
            .await
            .expect("second");

        let stored = store.get_character_stat("A", 8).expect("get").expect("present");
        assert_eq!(stored.wins, 3);
        assert_eq!(stored.losses, 4);
        assert_eq!(stored.latest_match_at, 200);
        assert_eq!(stored.pending, PendingDelta::default());
    }

    #[tokio::test]
    async fn test_participant_upsert_keeps_name_and_appends_history() {
        let store = SqliteStore::new(":memory:").expect("Failed to create database");
        let mut profile = ParticipantProfile {
            participant_id: "A".to_string(),
            name: "alpha".to_string(),
            platform_id: "pol-a".to_string(),
            power: 100,
            latest_match_at: 10,
        };
        let names = vec![NameHistoryEntry {
            participant_id: "A".to_string(),
            name: "alpha".to_string(),
        }];
        store
            .upsert_participants(&[profile.clone()], &names)
            .await
            .expect("first");

        profile.name = "alpha2".to_string();
        profile.power = 300;
        profile.latest_match_at = 20;
        let names = vec![
            NameHistoryEntry {
                participant_id: "A".to_string(),
                name: "alpha".to_string(),
            },
            NameHistoryEntry {
                participant_id: "A".to_string(),
                name: "alpha2".to_string(),
            },
        ];
        store
            .upsert_participants(&[profile], &names)
            .await
            .expect("second");

        let stored = store.get_participant("A").expect("get").expect("present");
        assert_eq!(stored.name, "alpha");
        assert_eq!(stored.power, 300);
        assert_eq!(stored.latest_match_at, 20);
        assert_eq!(store.names_for("A").expect("names"), vec!["alpha", "alpha2"]);
    }

    #[tokio::test]
    async fn test_load_by_participant_ids() {
        let store = SqliteStore::new(":memory:").expect("Failed to create database");
        store
            .upsert_character_stats(&[
                stat_with_delta("A", 8, 1, 0, 100),
                stat_with_delta("A", 9, 0, 1, 100),
                stat_with_delta("C", 8, 1, 0, 100),
            ])
            .await
            .expect("seed");

        let loaded = store
            .load_character_stats(&["A".to_string(), "B".to_string()])
            .await
            .expect("load");
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|s| s.participant_id == "A"));
        assert!(loaded.iter().all(|s| s.pending.is_zero()));
    }

    #[tokio::test]
    async fn test_aggregate_round_trip_by_category() {
        let store = SqliteStore::new(":memory:").expect("Failed to create database");
        let key = AggregateKey {
            game_version: 1,
            character_id: 8,
            rank: 10,
            category: Category::Overall,
        };
        let mut row = AggregatedStatistic::empty(key, 50);
        row.total_wins = 4;
        store.upsert_aggregated_statistics(&[row.clone()]).await.expect("upsert");

        row.total_wins = 7;
        store.upsert_aggregated_statistics(&[row.clone()]).await.expect("upsert");

        let overall = store
            .aggregated_statistics(1, Category::Overall)
            .await
            .expect("read");
        let standard = store
            .aggregated_statistics(1, Category::Standard)
            .await
            .expect("read");
        assert_eq!(overall, vec![row]);
        assert!(standard.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rankstats.db");
        let path = path.to_str().expect("utf-8 path");

        {
            let store = SqliteStore::new(path).expect("open");
            store
                .insert_matches(&[create_test_match("m1", 100)])
                .await
                .expect("insert");
            store
                .upsert_character_stats(&[stat_with_delta("A", 8, 1, 0, 100)])
                .await
                .expect("upsert");
        }

        let reopened = SqliteStore::new(path).expect("reopen");
        assert_eq!(reopened.all_match_ids().await.expect("ids"), vec!["m1".to_string()]);
        let a = reopened.get_character_stat("A", 8).expect("get").expect("present");
        assert_eq!((a.wins, a.losses), (1, 0));
    }
}
