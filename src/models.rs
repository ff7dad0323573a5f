use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Display format for `Match::date`, always rendered in UTC.
pub const MATCH_DATE_FORMAT: &str = "%m/%d/%Y %H:%M UTC";

/// Ids the replay feed sends either quoted or as bare integers
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Signed(n) => n.to_string(),
        RawId::Unsigned(n) => n.to_string(),
    })
}

/// Which side of a match a participant played on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    One,
    Two,
}

impl Slot {
    pub const BOTH: [Slot; 2] = [Slot::One, Slot::Two];

    pub fn number(self) -> u8 {
        match self {
            Slot::One => 1,
            Slot::Two => 2,
        }
    }
}

/// One completed two-participant match, as delivered by the replay feed.
///
/// Field names on the wire follow the upstream replay format; the Rust names
/// are the ones used throughout the crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    #[serde(rename = "battle_id")]
    pub match_id: String,
    /// Human-readable UTC date, filled in once the match is classified as new
    #[serde(default, skip_deserializing)]
    pub date: String,
    #[serde(rename = "battle_at")]
    pub played_at: i64,
    #[serde(rename = "battle_type", default)]
    pub match_type: i32,
    pub game_version: i32,

    #[serde(rename = "p1_chara_id")]
    pub p1_character_id: i32,
    pub p1_name: String,
    #[serde(rename = "p1_polaris_id", default, deserialize_with = "string_or_number")]
    pub p1_platform_id: String,
    #[serde(default)]
    pub p1_power: i64,
    #[serde(default)]
    pub p1_rank: i32,
    #[serde(default)]
    pub p1_rating_before: Option<i32>,
    #[serde(default)]
    pub p1_rating_change: Option<i32>,
    #[serde(rename = "p1_rounds", default)]
    pub p1_rounds_won: i32,
    #[serde(rename = "p1_user_id", deserialize_with = "string_or_number")]
    pub p1_participant_id: String,

    #[serde(rename = "p2_chara_id")]
    pub p2_character_id: i32,
    pub p2_name: String,
    #[serde(rename = "p2_polaris_id", default, deserialize_with = "string_or_number")]
    pub p2_platform_id: String,
    #[serde(default)]
    pub p2_power: i64,
    #[serde(default)]
    pub p2_rank: i32,
    #[serde(default)]
    pub p2_rating_before: Option<i32>,
    #[serde(default)]
    pub p2_rating_change: Option<i32>,
    #[serde(rename = "p2_rounds", default)]
    pub p2_rounds_won: i32,
    #[serde(rename = "p2_user_id", deserialize_with = "string_or_number")]
    pub p2_participant_id: String,

    #[serde(default)]
    pub stage_id: i32,
    pub winner: u8,
}

/// Borrowed view of one participant's columns in a match
#[derive(Debug, Clone, Copy)]
pub struct Side<'a> {
    pub slot: Slot,
    pub participant_id: &'a str,
    pub name: &'a str,
    pub platform_id: &'a str,
    pub character_id: i32,
    pub power: i64,
    pub rank: i32,
    pub rating_before: Option<i32>,
    pub rating_change: Option<i32>,
    pub rounds_won: i32,
    pub won: bool,
}

impl Side<'_> {
    pub fn rating_after(&self) -> i32 {
        self.rating_before.unwrap_or(0) + self.rating_change.unwrap_or(0)
    }
}

impl Match {
    pub fn side(&self, slot: Slot) -> Side<'_> {
        let won = self.winner == slot.number();
        match slot {
            Slot::One => Side {
                slot,
                participant_id: &self.p1_participant_id,
                name: &self.p1_name,
                platform_id: &self.p1_platform_id,
                character_id: self.p1_character_id,
                power: self.p1_power,
                rank: self.p1_rank,
                rating_before: self.p1_rating_before,
                rating_change: self.p1_rating_change,
                rounds_won: self.p1_rounds_won,
                won,
            },
            Slot::Two => Side {
                slot,
                participant_id: &self.p2_participant_id,
                name: &self.p2_name,
                platform_id: &self.p2_platform_id,
                character_id: self.p2_character_id,
                power: self.p2_power,
                rank: self.p2_rank,
                rating_before: self.p2_rating_before,
                rating_change: self.p2_rating_change,
                rounds_won: self.p2_rounds_won,
                won,
            },
        }
    }

    /// Checks the fields the pipeline relies on. A delivery containing any
    /// invalid match is rejected as a whole.
    pub fn validate(&self) -> Result<(), String> {
        if self.match_id.trim().is_empty() {
            return Err("empty battle_id".to_string());
        }
        if self.winner != 1 && self.winner != 2 {
            return Err(format!(
                "match {}: winner must be 1 or 2, got {}",
                self.match_id, self.winner
            ));
        }
        if self.p1_participant_id.trim().is_empty() || self.p2_participant_id.trim().is_empty() {
            return Err(format!("match {}: missing participant id", self.match_id));
        }
        Ok(())
    }

    pub fn formatted_date(&self) -> String {
        DateTime::<Utc>::from_timestamp(self.played_at, 0)
            .map(|dt| dt.format(MATCH_DATE_FORMAT).to_string())
            .unwrap_or_default()
    }

    /// Fills in the derived display date. Called once, when the match is
    /// accepted as new.
    pub fn annotate(mut self) -> Self {
        self.date = self.formatted_date();
        self
    }
}

/// A tracked player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub participant_id: String,
    pub name: String,
    pub platform_id: String,
    pub power: i64,
    /// Timestamp of the newest match absorbed into this profile
    pub latest_match_at: i64,
}

impl ParticipantProfile {
    pub fn from_side(side: &Side<'_>) -> Self {
        Self {
            participant_id: side.participant_id.to_string(),
            name: side.name.to_string(),
            platform_id: side.platform_id.to_string(),
            power: side.power,
            latest_match_at: 0,
        }
    }

    /// Applies power/name from a match only when it is newer than anything
    /// already absorbed. Returns whether the profile moved forward.
    pub fn absorb(&mut self, side: &Side<'_>, played_at: i64) -> bool {
        if played_at <= self.latest_match_at {
            return false;
        }
        self.latest_match_at = played_at;
        self.power = side.power;
        self.name = side.name.to_string();
        true
    }
}

/// Win/loss increments produced by one batch, not yet written to storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelta {
    pub wins: i64,
    pub losses: i64,
}

impl PendingDelta {
    pub fn is_zero(&self) -> bool {
        self.wins == 0 && self.losses == 0
    }
}

/// Composite key of a character stat row
pub type CharacterKey = (String, i32);

/// Per-participant, per-character record.
///
/// `wins`/`losses` mirror the stored cumulative totals plus whatever this
/// batch added; `pending` carries only this batch's contribution and is what
/// the writer adds to the stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterStat {
    pub participant_id: String,
    pub character_id: i32,
    pub game_version: i32,
    pub rank: i32,
    pub wins: i64,
    pub losses: i64,
    pub latest_match_at: i64,
    #[serde(skip)]
    pub pending: PendingDelta,
}

impl CharacterStat {
    pub fn new(participant_id: &str, character_id: i32) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            character_id,
            game_version: 0,
            rank: 0,
            wins: 0,
            losses: 0,
            latest_match_at: 0,
            pending: PendingDelta::default(),
        }
    }

    pub fn key(&self) -> CharacterKey {
        (self.participant_id.clone(), self.character_id)
    }

    pub fn record_result(&mut self, won: bool) {
        if won {
            self.wins += 1;
            self.pending.wins += 1;
        } else {
            self.losses += 1;
            self.pending.losses += 1;
        }
    }

    /// Rank, version and high-water mark only move forward in time.
    pub fn absorb(&mut self, rank: i32, game_version: i32, played_at: i64) -> bool {
        if played_at <= self.latest_match_at {
            return false;
        }
        self.latest_match_at = played_at;
        self.rank = rank;
        self.game_version = game_version;
        true
    }

    pub fn total_matches(&self) -> i64 {
        self.wins + self.losses
    }
}

/// A display name a participant has been seen using
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameHistoryEntry {
    pub participant_id: String,
    pub name: String,
}

/// Rollup flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Only each participant's most-played character
    Standard,
    /// Every character every participant has played
    Overall,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Standard, Category::Overall];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Standard => "standard",
            Category::Overall => "overall",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "standard" => Some(Category::Standard),
            "overall" => Some(Category::Overall),
            _ => None,
        }
    }
}

/// One row of `character_stats` as read by the aggregation engine
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterStatRow {
    pub participant_id: String,
    pub character_id: i32,
    pub rank: i32,
    pub wins: i64,
    pub losses: i64,
}

impl CharacterStatRow {
    pub fn total_matches(&self) -> i64 {
        self.wins + self.losses
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub game_version: i32,
    pub character_id: i32,
    pub rank: i32,
    pub category: Category,
}

/// Population-level rollup row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedStatistic {
    pub key: AggregateKey,
    pub total_wins: i64,
    pub total_losses: i64,
    pub total_players: i64,
    pub total_matches: i64,
    pub computed_at: i64,
}

impl AggregatedStatistic {
    pub fn empty(key: AggregateKey, computed_at: i64) -> Self {
        Self {
            key,
            total_wins: 0,
            total_losses: 0,
            total_players: 0,
            total_matches: 0,
            computed_at,
        }
    }

    pub fn reset(&mut self, computed_at: i64) {
        self.total_wins = 0;
        self.total_losses = 0;
        self.total_players = 0;
        self.total_matches = 0;
        self.computed_at = computed_at;
    }
}
