//! Durable storage contract for the ingestion pipeline and aggregation engine.
//!
//! The pipeline only relies on two storage guarantees: atomic
//! "insert, or update selected columns on key conflict" statements, and a
//! conflict signal that can be told apart from every other failure.

pub mod sqlite;

use async_trait::async_trait;
use std::collections::HashSet;

use crate::models::{
    AggregatedStatistic, Category, CharacterStat, CharacterStatRow, Match, NameHistoryEntry,
    ParticipantProfile,
};

pub use sqlite::SqliteStore;

/// Storage failure, split by whether retrying can help
#[derive(Debug)]
pub enum StoreError {
    /// Serialization failure, deadlock, busy or locked database
    Conflict(String),
    /// Anything else
    Backend(anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict(msg) => write!(f, "storage conflict: {}", msg),
            Self::Backend(e) => write!(f, "storage error: {:#}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, _) = &err {
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return StoreError::Conflict(err.to_string());
            }
        }
        StoreError::Backend(err.into())
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Every stored match id, used to seed the existence filter
    async fn all_match_ids(&self) -> StoreResult<Vec<String>>;

    /// Ids of the `limit` most recent matches by play time
    async fn recent_match_ids(&self, limit: usize) -> StoreResult<HashSet<String>>;

    /// Insert-or-ignore keyed by match id. Returns the number of new rows.
    async fn insert_matches(&self, matches: &[Match]) -> StoreResult<usize>;

    async fn load_participants(&self, ids: &[String]) -> StoreResult<Vec<ParticipantProfile>>;

    async fn load_character_stats(&self, ids: &[String]) -> StoreResult<Vec<CharacterStat>>;

    /// Upserts profiles (power and high-water mark on conflict) and appends
    /// unseen names, in one transaction.
    async fn upsert_participants(
        &self,
        profiles: &[ParticipantProfile],
        names: &[NameHistoryEntry],
    ) -> StoreResult<()>;

    /// Additive upsert of one chunk of character stats, in one transaction
    async fn upsert_character_stats(&self, chunk: &[CharacterStat]) -> StoreResult<()>;

    async fn game_versions(&self) -> StoreResult<Vec<i32>>;

    /// Rows for one game version, ordered by (participant, character)
    async fn character_stats_for_version(
        &self,
        game_version: i32,
    ) -> StoreResult<Vec<CharacterStatRow>>;

    async fn aggregated_statistics(
        &self,
        game_version: i32,
        category: Category,
    ) -> StoreResult<Vec<AggregatedStatistic>>;

    async fn upsert_aggregated_statistics(&self, rows: &[AggregatedStatistic]) -> StoreResult<()>;
}
