//! Collaborator adapters: patch metadata, reference cards, and deckstring decoding.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rdstats_core::{CardListing, PatchInfo};
use rdstats_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rdstats-adapters";

pub const DEFAULT_PATCHES_URL: &str =
    "https://static.zerotoheroes.com/hearthstone/data/patches.json";
pub const DEFAULT_CARDS_URL: &str =
    "https://static.zerotoheroes.com/hearthstone/jsoncards/cards.json";

// ---------------------------------------------------------------------------
// Patches

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchDocument {
    pub current_battlegrounds_meta_patch: u32,
    pub patches: Vec<PatchEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchEntry {
    pub number: u32,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub name: String,
    pub date: String,
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("fetching patch document: {0}")]
    Fetch(#[from] FetchError),
    #[error("patch {number} has unparseable date `{date}`")]
    MalformedDate { number: u32, date: String },
    #[error("no patch numbered {number} in patch document")]
    NotFound { number: u32 },
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` and bare dates; all read as UTC.
pub fn parse_patch_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Pick the entry flagged as the current meta patch.
pub fn select_current_patch(doc: &PatchDocument) -> Result<PatchInfo, PatchError> {
    let number = doc.current_battlegrounds_meta_patch;
    let entry = doc
        .patches
        .iter()
        .find(|p| p.number == number)
        .ok_or(PatchError::NotFound { number })?;
    let date = parse_patch_date(&entry.date).ok_or_else(|| PatchError::MalformedDate {
        number,
        date: entry.date.clone(),
    })?;
    Ok(PatchInfo {
        number,
        version: entry.version.clone(),
        name: entry.name.clone(),
        date,
    })
}

#[async_trait]
pub trait PatchSource: Send + Sync {
    async fn resolve(&self, run_id: Uuid) -> Result<PatchInfo, PatchError>;
}

pub struct HttpPatchResolver {
    http: HttpFetcher,
    url: String,
}

impl HttpPatchResolver {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PatchSource for HttpPatchResolver {
    async fn resolve(&self, run_id: Uuid) -> Result<PatchInfo, PatchError> {
        let doc: PatchDocument = self.http.fetch_json(run_id, &self.url).await?;
        let patch = select_current_patch(&doc)?;
        info!(
            %run_id,
            number = patch.number,
            version = %patch.version,
            date = %patch.date,
            "resolved current meta patch"
        );
        Ok(patch)
    }
}

// ---------------------------------------------------------------------------
// Reference cards

/// Either a numeric dbf id or a string card id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CardRef {
    DbfId(u32),
    CardId(String),
}

impl CardRef {
    /// All-digit input is a dbf id; anything else is a card id.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(dbf_id) = raw.parse() {
                return CardRef::DbfId(dbf_id);
            }
        }
        CardRef::CardId(raw.to_string())
    }
}

impl std::fmt::Display for CardRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CardRef::DbfId(id) => write!(f, "dbf:{id}"),
            CardRef::CardId(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceCard {
    pub id: String,
    #[serde(default)]
    pub dbf_id: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
}

pub trait CardLookup: Send + Sync {
    fn lookup(&self, reference: &CardRef) -> Option<&ReferenceCard>;
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceCardCatalog {
    by_id: HashMap<String, ReferenceCard>,
    id_by_dbf: HashMap<u32, String>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("fetching reference cards: {0}")]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing reference cards: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("reference card list is empty")]
    Empty,
}

impl ReferenceCardCatalog {
    pub fn from_cards(cards: impl IntoIterator<Item = ReferenceCard>) -> Self {
        let mut catalog = Self::default();
        for card in cards {
            if let Some(dbf_id) = card.dbf_id {
                catalog.id_by_dbf.insert(dbf_id, card.id.clone());
            }
            catalog.by_id.insert(card.id.clone(), card);
        }
        catalog
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, CatalogError> {
        let cards: Vec<ReferenceCard> = serde_json::from_slice(bytes)?;
        if cards.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self::from_cards(cards))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl CardLookup for ReferenceCardCatalog {
    fn lookup(&self, reference: &CardRef) -> Option<&ReferenceCard> {
        match reference {
            CardRef::DbfId(dbf_id) => self.id_by_dbf.get(dbf_id).and_then(|id| self.by_id.get(id)),
            CardRef::CardId(id) => self.by_id.get(id),
        }
    }
}

/// Loaded fresh each run that includes card lists.
#[async_trait]
pub trait CardCatalogSource: Send + Sync {
    async fn load(&self, run_id: Uuid) -> Result<ReferenceCardCatalog, CatalogError>;
}

pub struct HttpCardCatalogSource {
    http: HttpFetcher,
    url: String,
}

impl HttpCardCatalogSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CardCatalogSource for HttpCardCatalogSource {
    async fn load(&self, run_id: Uuid) -> Result<ReferenceCardCatalog, CatalogError> {
        let fetched = self.http.fetch_bytes(run_id, &self.url).await?;
        let catalog = ReferenceCardCatalog::from_json_slice(&fetched.body)?;
        info!(%run_id, cards = catalog.len(), "loaded reference cards");
        Ok(catalog)
    }
}

pub struct FileCardCatalogSource {
    path: PathBuf,
}

impl FileCardCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CardCatalogSource for FileCardCatalogSource {
    async fn load(&self, run_id: Uuid) -> Result<ReferenceCardCatalog, CatalogError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|source| CatalogError::Io {
            path: self.path.clone(),
            source,
        })?;
        let catalog = ReferenceCardCatalog::from_json_slice(&bytes)?;
        info!(
            %run_id,
            cards = catalog.len(),
            path = %self.path.display(),
            "loaded reference cards"
        );
        Ok(catalog)
    }
}

// ---------------------------------------------------------------------------
// Deckstrings

#[derive(Debug, Error)]
pub enum DeckDecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("deckstring ended after {0} bytes")]
    Truncated(usize),
    #[error("expected reserved byte 0, found {0}")]
    Reserved(u8),
    #[error("unsupported deckstring version {0}")]
    UnsupportedVersion(u64),
    #[error("varint value out of range")]
    Overflow,
    #[error("unknown card {0}")]
    UnknownCard(CardRef),
    #[error("deck has no cards")]
    Empty,
    #[error("deck claims {0} card copies")]
    TooManyCopies(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedDeck {
    pub format: u64,
    pub heroes: Vec<u32>,
    /// `(card, copies)` in encoded order.
    pub cards: Vec<(CardRef, u32)>,
}

pub trait DeckCodec: Send + Sync {
    fn decode(&self, deckstring: &str) -> Result<DecodedDeck, DeckDecodeError>;
}

const DECKSTRING_VERSION: u64 = 1;

/// Upper bound on expanded cards per deck, and so on any single copy count.
pub const MAX_DECK_CARDS: u64 = 250;

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

struct VarintReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> VarintReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, DeckDecodeError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(DeckDecodeError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Result<u64, DeckDecodeError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let b = self.byte()?;
            if shift >= 64 {
                return Err(DeckDecodeError::Overflow);
            }
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn varint_u32(&mut self) -> Result<u32, DeckDecodeError> {
        u32::try_from(self.varint()?).map_err(|_| DeckDecodeError::Overflow)
    }
}

/// Base64 varint deckstrings: reserved byte, version, format, heroes, then
/// single-copy, double-copy and n-copy card sections. Trailing sections are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct HearthstoneDeckstringCodec;

impl DeckCodec for HearthstoneDeckstringCodec {
    fn decode(&self, deckstring: &str) -> Result<DecodedDeck, DeckDecodeError> {
        let bytes = LENIENT_BASE64.decode(deckstring.trim())?;
        let mut reader = VarintReader::new(&bytes);

        let reserved = reader.byte()?;
        if reserved != 0 {
            return Err(DeckDecodeError::Reserved(reserved));
        }
        let version = reader.varint()?;
        if version != DECKSTRING_VERSION {
            return Err(DeckDecodeError::UnsupportedVersion(version));
        }
        let format = reader.varint()?;

        let hero_count = reader.varint()?;
        let mut heroes = Vec::new();
        for _ in 0..hero_count {
            heroes.push(reader.varint_u32()?);
        }

        let mut cards = Vec::new();
        for copies in [1u32, 2] {
            let count = reader.varint()?;
            for _ in 0..count {
                cards.push((CardRef::DbfId(reader.varint_u32()?), copies));
            }
        }
        let multi_count = reader.varint()?;
        for _ in 0..multi_count {
            let dbf_id = reader.varint_u32()?;
            let copies = reader.varint_u32()?;
            if u64::from(copies) > MAX_DECK_CARDS {
                return Err(DeckDecodeError::TooManyCopies(copies.into()));
            }
            cards.push((CardRef::DbfId(dbf_id), copies));
        }

        Ok(DecodedDeck {
            format,
            heroes,
            cards,
        })
    }
}

/// Turns a deckstring into canonical card ids, one entry per copy.
#[derive(Clone)]
pub struct DeckDecoder {
    codec: Arc<dyn DeckCodec>,
    cards: Arc<dyn CardLookup>,
}

impl DeckDecoder {
    pub fn new(codec: Arc<dyn DeckCodec>, cards: Arc<dyn CardLookup>) -> Self {
        Self { codec, cards }
    }

    pub fn card_ids(&self, deckstring: &str) -> Result<Vec<String>, DeckDecodeError> {
        let deck = self.codec.decode(deckstring)?;
        let total = deck
            .cards
            .iter()
            .try_fold(0u64, |total, (_, copies)| total.checked_add(u64::from(*copies)))
            .unwrap_or(u64::MAX);
        if total > MAX_DECK_CARDS {
            return Err(DeckDecodeError::TooManyCopies(total));
        }
        let mut ids = Vec::new();
        for (reference, copies) in &deck.cards {
            let card = self
                .cards
                .lookup(reference)
                .ok_or_else(|| DeckDecodeError::UnknownCard(reference.clone()))?;
            ids.extend(std::iter::repeat(card.id.clone()).take(*copies as usize));
        }
        if ids.is_empty() {
            return Err(DeckDecodeError::Empty);
        }
        Ok(ids)
    }

    /// Never fails: an undecodable deck is logged and reported as such.
    pub fn listing(&self, deckstring: &str) -> CardListing {
        match self.card_ids(deckstring) {
            Ok(ids) => CardListing::Cards(ids),
            Err(err) => {
                warn!(deckstring, error = %err, "could not decode deckstring");
                CardListing::Undecodable
            }
        }
    }
}
