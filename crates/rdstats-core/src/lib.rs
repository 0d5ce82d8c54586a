//! Core domain model and aggregation passes for ranked deck stats.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "rdstats-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameFormat {
    Standard,
    Wild,
}

impl GameFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameFormat::Standard => "standard",
            GameFormat::Wild => "wild",
        }
    }
}

impl fmt::Display for GameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown game format `{0}`")]
pub struct UnknownGameFormat(pub String);

impl FromStr for GameFormat {
    type Err = UnknownGameFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(GameFormat::Standard),
            "wild" => Ok(GameFormat::Wild),
            _ => Err(UnknownGameFormat(s.to_string())),
        }
    }
}

/// Game patch that bounds the query window. Only `date` feeds the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchInfo {
    pub number: u32,
    pub version: String,
    pub name: String,
    pub date: DateTime<Utc>,
}

/// One pre-aggregated row per (format, archetype, deckstring) in the query window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRow {
    pub game_format: GameFormat,
    pub archetype_id: String,
    pub deckstring: String,
    pub wins: u64,
    pub losses: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeckList {
    pub deckstring: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cards: Option<Vec<String>>,
    pub wins: u64,
    pub losses: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchetypeResult {
    pub archetype_id: String,
    pub game_format: GameFormat,
    pub wins: u64,
    pub losses: u64,
    pub decklists: Vec<DeckList>,
}

impl ArchetypeResult {
    pub fn sample_size(&self) -> u64 {
        self.wins.saturating_add(self.losses)
    }
}

/// The published artifact. Each run replaces the previous one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ArchetypeStats {
    pub last_patch: Vec<ArchetypeResult>,
}

impl ArchetypeStats {
    pub fn new(last_patch: Vec<ArchetypeResult>) -> Self {
        Self { last_patch }
    }
}

/// What the deck decoder produced for a single deckstring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardListing {
    /// Card lists are not part of this run; the deck is kept without cards.
    Omitted,
    Cards(Vec<String>),
    Undecodable,
}

impl CardListing {
    fn into_cards(self) -> Option<Option<Vec<String>>> {
        match self {
            CardListing::Omitted => Some(None),
            CardListing::Cards(cards) if !cards.is_empty() => Some(Some(cards)),
            CardListing::Cards(_) | CardListing::Undecodable => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WinLoss {
    pub wins: u64,
    pub losses: u64,
}

impl WinLoss {
    pub fn add(&mut self, wins: u64, losses: u64) {
        self.wins = self.wins.saturating_add(wins);
        self.losses = self.losses.saturating_add(losses);
    }
}

/// Fold `items` into one accumulator per key. Keys come out in ascending order.
pub fn group_by_reduce<T, K, A, F, I, R>(
    items: impl IntoIterator<Item = T>,
    mut key: F,
    mut init: I,
    mut reduce: R,
) -> BTreeMap<K, A>
where
    K: Ord,
    F: FnMut(&T) -> K,
    I: FnMut() -> A,
    R: FnMut(&mut A, T),
{
    let mut out = BTreeMap::new();
    for item in items {
        let acc = out.entry(key(&item)).or_insert_with(&mut init);
        reduce(acc, item);
    }
    out
}

pub fn group_by<T, K, F>(items: impl IntoIterator<Item = T>, key: F) -> BTreeMap<K, Vec<T>>
where
    K: Ord,
    F: FnMut(&T) -> K,
{
    group_by_reduce(items, key, Vec::new, |acc, item| acc.push(item))
}

/// Partition rows by archetype, then by format, and total each partition.
///
/// Totals always cover every row of the partition. `listing_for` is asked once per
/// row; rows it reports as undecodable (or with an empty card list) are left out of
/// `decklists` but still count toward `wins`/`losses`.
pub fn group_match_rows<F>(rows: &[MatchRow], mut listing_for: F) -> Vec<ArchetypeResult>
where
    F: FnMut(&MatchRow) -> CardListing,
{
    let by_archetype = group_by(rows.iter(), |row| row.archetype_id.clone());

    let mut out = Vec::new();
    for (archetype_id, archetype_rows) in by_archetype {
        for (game_format, format_rows) in group_by(archetype_rows, |row| row.game_format) {
            let mut totals = WinLoss::default();
            let mut decklists = Vec::with_capacity(format_rows.len());
            for row in format_rows {
                totals.add(row.wins, row.losses);
                if let Some(cards) = listing_for(row).into_cards() {
                    decklists.push(DeckList {
                        deckstring: row.deckstring.clone(),
                        cards,
                        wins: row.wins,
                        losses: row.losses,
                    });
                }
            }
            out.push(ArchetypeResult {
                archetype_id: archetype_id.clone(),
                game_format,
                wins: totals.wins,
                losses: totals.losses,
                decklists,
            });
        }
    }
    out
}

/// Keep results whose sample size is strictly above `threshold`.
pub fn retain_above_threshold(
    results: Vec<ArchetypeResult>,
    threshold: u64,
) -> Vec<ArchetypeResult> {
    results
        .into_iter()
        .filter(|result| result.sample_size() > threshold)
        .collect()
}
