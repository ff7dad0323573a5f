//! Population rollups over one game version's character stats.
//!
//! Pure functions: the engine feeds in a snapshot and the stored rows, and
//! gets back the full set of rows to upsert.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::{AggregateKey, AggregatedStatistic, Category, CharacterStatRow};

/// Each participant's most-played character (wins + losses). Ties keep the
/// row seen first in scan order.
pub fn most_played(rows: &[CharacterStatRow]) -> Vec<&CharacterStatRow> {
    let mut best: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();

    for (i, row) in rows.iter().enumerate() {
        match best.get(row.participant_id.as_str()) {
            Some(&current) if rows[current].total_matches() >= row.total_matches() => {}
            Some(_) => {
                best.insert(&row.participant_id, i);
            }
            None => {
                best.insert(&row.participant_id, i);
                order.push(&row.participant_id);
            }
        }
    }

    order.iter().map(|id| &rows[best[id]]).collect()
}

/// Rows contributing to `category`
pub fn select<'a>(rows: &'a [CharacterStatRow], category: Category) -> Vec<&'a CharacterStatRow> {
    match category {
        Category::Standard => most_played(rows),
        Category::Overall => rows.iter().collect(),
    }
}

/// Recomputes every (character, rank) bucket for one version and category.
///
/// Stored rows are the base. A key is reset the first time the scan touches
/// it; keys the scan never touches are reset too, so the result is always a
/// full snapshot of this version. Output is ordered by key.
///
/// Zeroed rows stay in storage. A version that no longer appears in any
/// character stat is never passed in here and keeps its last snapshot.
pub fn aggregate(
    selection: &[&CharacterStatRow],
    game_version: i32,
    category: Category,
    existing: Vec<AggregatedStatistic>,
    computed_at: i64,
) -> Vec<AggregatedStatistic> {
    let mut buckets: BTreeMap<AggregateKey, AggregatedStatistic> = existing
        .into_iter()
        .filter(|s| s.key.game_version == game_version && s.key.category == category)
        .map(|s| (s.key, s))
        .collect();
    let mut players: HashMap<AggregateKey, HashSet<&str>> = HashMap::new();

    for row in selection {
        let key = AggregateKey {
            game_version,
            character_id: row.character_id,
            rank: row.rank,
            category,
        };
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| AggregatedStatistic::empty(key, computed_at));
        let contributors = players.entry(key).or_insert_with(|| {
            bucket.reset(computed_at);
            HashSet::new()
        });

        contributors.insert(row.participant_id.as_str());
        bucket.total_wins += row.wins;
        bucket.total_losses += row.losses;
        bucket.total_matches += row.total_matches();
    }

    for (key, bucket) in buckets.iter_mut() {
        match players.get(key) {
            Some(contributors) => bucket.total_players = contributors.len() as i64,
            None => bucket.reset(computed_at),
        }
    }

    buckets.into_values().collect()
}
