//! Folds new matches into per-participant and per-character working state.
//!
//! The accumulator owns its working set for exactly one batch. Nothing here
//! touches storage: the caller seeds it with the stored rows of the batch's
//! participants and hands the resulting [`BatchDelta`] to the writer.

use std::collections::{HashMap, HashSet};

use crate::models::{
    CharacterKey, CharacterStat, Match, NameHistoryEntry, ParticipantProfile, Slot,
};

/// Everything one batch changed, ready to flush
#[derive(Debug, Clone, Default)]
pub struct BatchDelta {
    pub profiles: Vec<ParticipantProfile>,
    pub character_stats: Vec<CharacterStat>,
    pub names: Vec<NameHistoryEntry>,
}

#[derive(Debug, Default)]
pub struct BatchAccumulator {
    profiles: HashMap<String, ParticipantProfile>,
    stats: HashMap<CharacterKey, CharacterStat>,
    known_names: HashSet<NameHistoryEntry>,
    new_names: Vec<NameHistoryEntry>,
    touched_profiles: HashSet<String>,
    touched_stats: HashSet<CharacterKey>,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from stored state so recency checks compare against what is
    /// already persisted. Pending deltas always start at zero.
    pub fn with_existing(
        profiles: impl IntoIterator<Item = ParticipantProfile>,
        stats: impl IntoIterator<Item = CharacterStat>,
    ) -> Self {
        let mut acc = Self::default();
        for p in profiles {
            acc.known_names.insert(NameHistoryEntry {
                participant_id: p.participant_id.clone(),
                name: p.name.clone(),
            });
            acc.profiles.insert(p.participant_id.clone(), p);
        }
        for mut s in stats {
            s.pending = Default::default();
            acc.stats.insert(s.key(), s);
        }
        acc
    }

    pub fn apply_all<'a>(&mut self, matches: impl IntoIterator<Item = &'a Match>) {
        for m in matches {
            self.apply(m);
        }
    }

    pub fn apply(&mut self, m: &Match) {
        for slot in Slot::BOTH {
            let side = m.side(slot);
            let participant_id = side.participant_id.to_string();

            let profile = self
                .profiles
                .entry(participant_id.clone())
                .or_insert_with(|| ParticipantProfile::from_side(&side));

            let name = NameHistoryEntry {
                participant_id: participant_id.clone(),
                name: side.name.to_string(),
            };
            if !self.known_names.contains(&name) {
                self.known_names.insert(name.clone());
                self.new_names.push(name);
            }

            let key = (participant_id.clone(), side.character_id);
            let stat = self
                .stats
                .entry(key.clone())
                .or_insert_with(|| CharacterStat::new(side.participant_id, side.character_id));

            stat.record_result(side.won);
            // older matches still count towards totals but never regress
            // rank, version, power or high-water marks
            if stat.absorb(side.rank, m.game_version, m.played_at) {
                profile.absorb(&side, m.played_at);
            }

            self.touched_profiles.insert(participant_id);
            self.touched_stats.insert(key);
        }
    }

    /// Touched profiles and stats, sorted by key
    pub fn finish(mut self) -> BatchDelta {
        let mut profiles: Vec<_> = self
            .touched_profiles
            .iter()
            .filter_map(|id| self.profiles.remove(id))
            .collect();
        profiles.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));

        let mut character_stats: Vec<_> = self
            .touched_stats
            .iter()
            .filter_map(|key| self.stats.remove(key))
            .collect();
        character_stats.sort_by(|a, b| {
            (&a.participant_id, a.character_id).cmp(&(&b.participant_id, b.character_id))
        });

        BatchDelta {
            profiles,
            character_stats,
            names: self.new_names,
        }
    }
}
