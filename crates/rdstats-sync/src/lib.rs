//! Ranked deck stats job: configuration, match-row query, orchestration and scheduling.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdstats_adapters::{
    CardCatalogSource, CatalogError, DeckCodec, DeckDecoder, FileCardCatalogSource,
    HearthstoneDeckstringCodec, HttpCardCatalogSource, HttpPatchResolver, PatchError, PatchSource,
    DEFAULT_CARDS_URL, DEFAULT_PATCHES_URL,
};
use rdstats_core::{
    group_match_rows, retain_above_threshold, ArchetypeStats, CardListing, GameFormat, MatchRow,
};
use rdstats_storage::{
    FsSnapshotStore, HttpClientConfig, HttpFetcher, HttpSnapshotStore, PublishError,
    SnapshotDestination, SnapshotPublisher, SnapshotStore, DEFAULT_BUCKET,
};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, MySqlConnection, Row};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rdstats-sync";

pub const RANKED_DECKS_PROFILE: &str = "ranked-decks";
pub const RANKED_ARCHETYPES_PROFILE: &str = "ranked-archetypes";

/// One configured variant of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProfile {
    pub name: String,
    pub threshold: u64,
    pub include_cards: bool,
    pub key: String,
    #[serde(default)]
    pub cron: Option<String>,
}

impl JobProfile {
    pub fn ranked_decks() -> Self {
        Self {
            name: RANKED_DECKS_PROFILE.to_string(),
            threshold: 10,
            include_cards: true,
            key: "api/ranked-decks.json".to_string(),
            cron: None,
        }
    }

    pub fn ranked_archetypes() -> Self {
        Self {
            name: RANKED_ARCHETYPES_PROFILE.to_string(),
            threshold: 50,
            include_cards: false,
            key: "api/ranked-archetypes.json".to_string(),
            cron: None,
        }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            RANKED_DECKS_PROFILE => Some(Self::ranked_decks()),
            RANKED_ARCHETYPES_PROFILE => Some(Self::ranked_archetypes()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ProfilesFile {
    profiles: Vec<JobProfile>,
}

pub fn parse_profiles_yaml(text: &str) -> Result<Vec<JobProfile>> {
    let file: ProfilesFile = serde_yaml::from_str(text).context("parsing job profiles")?;
    if file.profiles.is_empty() {
        bail!("profiles file declares no profiles");
    }
    Ok(file.profiles)
}

pub async fn load_profiles(path: &Path) -> Result<Vec<JobProfile>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_profiles_yaml(&text).with_context(|| format!("loading {}", path.display()))
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub database_url: String,
    pub patches_url: String,
    pub cards_url: String,
    pub cards_path: Option<PathBuf>,
    pub profile: JobProfile,
    pub bucket: String,
    pub store_endpoint: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub profiles_file: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub bind_addr: String,
}

impl JobConfig {
    pub fn from_env() -> Result<Self> {
        let profile_name =
            std::env::var("RDSTATS_PROFILE").unwrap_or_else(|_| RANKED_DECKS_PROFILE.to_string());
        let mut profile = JobProfile::builtin(&profile_name)
            .with_context(|| format!("unknown RDSTATS_PROFILE `{profile_name}`"))?;
        if let Some(raw) = env_opt("RDSTATS_THRESHOLD") {
            profile.threshold = raw.trim().parse().with_context(|| {
                format!("RDSTATS_THRESHOLD must be a non-negative integer, got `{raw}`")
            })?;
        }
        if let Some(include_cards) = env_flag("RDSTATS_INCLUDE_CARDS") {
            profile.include_cards = include_cards;
        }
        if let Some(key) = env_opt("RDSTATS_KEY") {
            profile.key = key;
        }
        profile.cron = env_opt("RDSTATS_CRON");

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "mysql://root@localhost:3306/replays".to_string()),
            patches_url: std::env::var("RDSTATS_PATCHES_URL")
                .unwrap_or_else(|_| DEFAULT_PATCHES_URL.to_string()),
            cards_url: std::env::var("RDSTATS_CARDS_URL")
                .unwrap_or_else(|_| DEFAULT_CARDS_URL.to_string()),
            cards_path: env_opt("RDSTATS_CARDS_PATH").map(PathBuf::from),
            profile,
            bucket: std::env::var("RDSTATS_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.to_string()),
            store_endpoint: env_opt("RDSTATS_STORE_ENDPOINT"),
            output_dir: env_opt("RDSTATS_OUTPUT_DIR").map(PathBuf::from),
            scheduler_enabled: env_flag("RDSTATS_SCHEDULER_ENABLED").unwrap_or(false),
            profiles_file: env_opt("RDSTATS_PROFILES_FILE").map(PathBuf::from),
            user_agent: std::env::var("RDSTATS_USER_AGENT")
                .unwrap_or_else(|_| "rdstats/0.1".to_string()),
            http_timeout_secs: std::env::var("RDSTATS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            bind_addr: std::env::var("RDSTATS_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn destination_for(&self, profile: &JobProfile) -> SnapshotDestination {
        SnapshotDestination::gzip_json(self.bucket.clone(), profile.key.clone())
    }

    /// HTTP endpoint wins over a local output directory.
    pub fn snapshot_store(&self) -> Result<Arc<dyn SnapshotStore>> {
        if let Some(endpoint) = &self.store_endpoint {
            let store = HttpSnapshotStore::new(endpoint.clone(), self.http_client_config())?;
            return Ok(Arc::new(store));
        }
        if let Some(dir) = &self.output_dir {
            return Ok(Arc::new(FsSnapshotStore::new(dir.clone())));
        }
        bail!("no snapshot store configured: set RDSTATS_STORE_ENDPOINT or RDSTATS_OUTPUT_DIR")
    }

    /// Profiles file when configured, otherwise the active profile alone.
    pub async fn profiles(&self) -> Result<Vec<JobProfile>> {
        match &self.profiles_file {
            Some(path) => load_profiles(path).await,
            None => Ok(vec![self.profile.clone()]),
        }
    }
}

// ---------------------------------------------------------------------------
// Match rows

pub const MATCH_ROWS_QUERY: &str = r#"
    SELECT
        gameFormat,
        playerArchetypeId,
        playerDeckstring,
        CAST(SUM(CASE WHEN result = 'won' THEN 1 ELSE 0 END) AS SIGNED) AS wins,
        CAST(SUM(CASE WHEN result = 'lost' THEN 1 ELSE 0 END) AS SIGNED) AS losses
    FROM ranked_decks
    WHERE creationDate > ?
    GROUP BY gameFormat, playerArchetypeId, playerDeckstring
"#;

/// `DATETIME(6)` literal with the fractional part zeroed.
pub fn sql_datetime_literal(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S.000000").to_string()
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("connecting to database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("running match query: {0}")]
    Query(#[source] sqlx::Error),
}

#[async_trait]
pub trait MatchRowSource: Send + Sync {
    async fn fetch_rows(
        &self,
        run_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<MatchRow>, QueryError>;
}

/// Build a row from raw column values; rows the job cannot group are skipped.
pub fn match_row_from_columns(
    game_format: Option<&str>,
    archetype_id: Option<String>,
    deckstring: Option<String>,
    wins: i64,
    losses: i64,
) -> Option<MatchRow> {
    let Some(raw_format) = game_format else {
        warn!("skipping row without gameFormat");
        return None;
    };
    let game_format: GameFormat = match raw_format.parse() {
        Ok(format) => format,
        Err(err) => {
            warn!(error = %err, "skipping row");
            return None;
        }
    };
    let Some(archetype_id) = archetype_id.filter(|a| !a.is_empty()) else {
        warn!(%game_format, "skipping row without archetype");
        return None;
    };
    Some(MatchRow {
        game_format,
        archetype_id,
        deckstring: deckstring.unwrap_or_default(),
        wins: wins.max(0) as u64,
        losses: losses.max(0) as u64,
    })
}

/// An open database session that can produce match rows once and then be released.
#[async_trait]
pub trait MatchRowConnection: Send {
    async fn match_rows(&mut self, since: DateTime<Utc>) -> Result<Vec<MatchRow>, sqlx::Error>;

    async fn release(self) -> Result<(), sqlx::Error>;
}

/// Runs the query and releases the connection on both the success and the error path.
pub async fn fetch_then_release<C>(
    run_id: Uuid,
    mut conn: C,
    since: DateTime<Utc>,
) -> Result<Vec<MatchRow>, QueryError>
where
    C: MatchRowConnection,
{
    let fetched = conn.match_rows(since).await;
    if let Err(err) = conn.release().await {
        warn!(%run_id, error = %err, "closing database connection");
    }
    fetched.map_err(QueryError::Query)
}

fn archetype_column(row: &sqlx::mysql::MySqlRow) -> Result<Option<String>, sqlx::Error> {
    row.try_get::<Option<String>, _>("playerArchetypeId").or_else(|_| {
        row.try_get::<Option<i64>, _>("playerArchetypeId")
            .map(|v| v.map(|n| n.to_string()))
    })
}

#[async_trait]
impl MatchRowConnection for MySqlConnection {
    async fn match_rows(&mut self, since: DateTime<Utc>) -> Result<Vec<MatchRow>, sqlx::Error> {
        let fetched = sqlx::query(MATCH_ROWS_QUERY)
            .bind(since.naive_utc())
            .fetch_all(&mut *self)
            .await?;

        let mut rows = Vec::new();
        for row in fetched {
            let game_format: Option<String> = row.try_get("gameFormat")?;
            let archetype_id = archetype_column(&row)?;
            let deckstring: Option<String> = row.try_get("playerDeckstring")?;
            let wins: Option<i64> = row.try_get("wins")?;
            let losses: Option<i64> = row.try_get("losses")?;
            if let Some(row) = match_row_from_columns(
                game_format.as_deref(),
                archetype_id,
                deckstring,
                wins.unwrap_or(0),
                losses.unwrap_or(0),
            ) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn release(self) -> Result<(), sqlx::Error> {
        Connection::close(self).await
    }
}

/// One connection per fetch, closed whether or not the query succeeded.
pub struct MySqlMatchSource {
    database_url: String,
}

impl MySqlMatchSource {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl MatchRowSource for MySqlMatchSource {
    async fn fetch_rows(
        &self,
        run_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<MatchRow>, QueryError> {
        let conn = MySqlConnection::connect(&self.database_url)
            .await
            .map_err(QueryError::Connect)?;

        info!(
            %run_id,
            since = %sql_datetime_literal(since),
            query = MATCH_ROWS_QUERY,
            "running query"
        );
        let rows = fetch_then_release(run_id, conn, since).await?;
        info!(%run_id, rows = rows.len(), "query complete");
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Pipeline

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineStage {
    ResolvePatch,
    Query,
    Transform,
    Serialize,
    Publish,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::ResolvePatch => "resolve_patch",
            PipelineStage::Query => "query",
            PipelineStage::Transform => "transform",
            PipelineStage::Serialize => "serialize",
            PipelineStage::Publish => "publish",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("fetching {what}: {source}")]
    UpstreamFetch {
        stage: PipelineStage,
        what: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("no patch numbered {0} in patch document")]
    PatchNotFound(u32),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("serializing snapshot: {0}")]
    Serialize(#[source] PublishError),
    #[error("publishing snapshot: {0}")]
    Publish(#[source] PublishError),
}

impl JobError {
    pub fn stage(&self) -> PipelineStage {
        match self {
            JobError::UpstreamFetch { stage, .. } => *stage,
            JobError::PatchNotFound(_) => PipelineStage::ResolvePatch,
            JobError::Query(_) => PipelineStage::Query,
            JobError::Serialize(_) => PipelineStage::Serialize,
            JobError::Publish(_) => PipelineStage::Publish,
        }
    }
}

impl From<PatchError> for JobError {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::NotFound { number } => JobError::PatchNotFound(number),
            other => JobError::UpstreamFetch {
                stage: PipelineStage::ResolvePatch,
                what: "patch document",
                source: Box::new(other),
            },
        }
    }
}

impl From<CatalogError> for JobError {
    fn from(err: CatalogError) -> Self {
        JobError::UpstreamFetch {
            stage: PipelineStage::Transform,
            what: "reference cards",
            source: Box::new(err),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub patch_number: u32,
    pub patch_version: String,
    pub rows: usize,
    pub groups: usize,
    pub published_results: usize,
    pub undecodable_decks: usize,
    pub destination: String,
    pub json_bytes: usize,
    pub gzip_bytes: usize,
    pub sha256: String,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self) -> Result<RunSummary, JobError>;
}

pub struct RankedStatsPipeline {
    profile: JobProfile,
    patches: Box<dyn PatchSource>,
    rows: Box<dyn MatchRowSource>,
    cards: Box<dyn CardCatalogSource>,
    codec: Arc<dyn DeckCodec>,
    publisher: SnapshotPublisher,
}

impl RankedStatsPipeline {
    pub fn new(
        profile: JobProfile,
        patches: Box<dyn PatchSource>,
        rows: Box<dyn MatchRowSource>,
        cards: Box<dyn CardCatalogSource>,
        publisher: SnapshotPublisher,
    ) -> Self {
        Self {
            profile,
            patches,
            rows,
            cards,
            codec: Arc::new(HearthstoneDeckstringCodec),
            publisher,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn DeckCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn from_config(config: &JobConfig, profile: JobProfile) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let patches = HttpPatchResolver::new(http.clone(), config.patches_url.clone());
        let cards: Box<dyn CardCatalogSource> = match &config.cards_path {
            Some(path) => Box::new(FileCardCatalogSource::new(path.clone())),
            None => Box::new(HttpCardCatalogSource::new(http, config.cards_url.clone())),
        };
        let publisher =
            SnapshotPublisher::new(config.snapshot_store()?, config.destination_for(&profile));
        Ok(Self::new(
            profile,
            Box::new(patches),
            Box::new(MySqlMatchSource::new(config.database_url.clone())),
            cards,
            publisher,
        ))
    }

    pub fn profile(&self) -> &JobProfile {
        &self.profile
    }

    pub fn publisher(&self) -> &SnapshotPublisher {
        &self.publisher
    }

    /// Resolve patch, query, transform, serialize, publish. Any failure ends the run.
    pub async fn run_once(&self) -> Result<RunSummary, JobError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ranked_stats_run", %run_id, profile = %self.profile.name);
        self.run_stages(run_id)
            .instrument(span)
            .await
            .inspect_err(|err| error!(%run_id, stage = %err.stage(), error = %err, "run failed"))
    }

    async fn run_stages(&self, run_id: Uuid) -> Result<RunSummary, JobError> {
        let started_at = Utc::now();

        enter(PipelineStage::ResolvePatch);
        let patch = self.patches.resolve(run_id).await?;

        enter(PipelineStage::Query);
        let rows = self.rows.fetch_rows(run_id, patch.date).await?;

        enter(PipelineStage::Transform);
        let decoder = if self.profile.include_cards {
            let catalog = self.cards.load(run_id).await?;
            Some(DeckDecoder::new(self.codec.clone(), Arc::new(catalog)))
        } else {
            None
        };
        let mut undecodable_decks = 0usize;
        let grouped = group_match_rows(&rows, |row| match &decoder {
            None => CardListing::Omitted,
            Some(decoder) => {
                let listing = decoder.listing(&row.deckstring);
                if listing == CardListing::Undecodable {
                    undecodable_decks += 1;
                }
                listing
            }
        });
        let groups = grouped.len();
        let kept = retain_above_threshold(grouped, self.profile.threshold);
        info!(
            rows = rows.len(),
            groups,
            kept = kept.len(),
            threshold = self.profile.threshold,
            undecodable_decks,
            "built archetype stats"
        );
        let stats = ArchetypeStats::new(kept);

        enter(PipelineStage::Serialize);
        let encoded = self.publisher.encode(&stats).map_err(JobError::Serialize)?;

        enter(PipelineStage::Publish);
        let published = self
            .publisher
            .publish_encoded(encoded)
            .await
            .map_err(JobError::Publish)?;

        Ok(RunSummary {
            run_id,
            profile: self.profile.name.clone(),
            started_at,
            finished_at: Utc::now(),
            patch_number: patch.number,
            patch_version: patch.version,
            rows: rows.len(),
            groups,
            published_results: stats.last_patch.len(),
            undecodable_decks,
            destination: published.destination.to_string(),
            json_bytes: published.json_bytes,
            gzip_bytes: published.gzip_bytes,
            sha256: published.sha256,
        })
    }
}

fn enter(stage: PipelineStage) {
    info!(%stage, "entering stage");
}

#[async_trait]
impl JobRunner for RankedStatsPipeline {
    async fn run_job(&self) -> Result<RunSummary, JobError> {
        self.run_once().await
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = JobConfig::from_env()?;
    let pipeline = RankedStatsPipeline::from_config(&config, config.profile.clone())?;
    Ok(pipeline.run_once().await?)
}

/// One cron job per profile that carries a cron expression.
pub async fn build_scheduler(
    config: &JobConfig,
    profiles: Vec<JobProfile>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let mut scheduled = 0usize;
    for profile in profiles {
        let Some(cron) = profile.cron.clone() else {
            warn!(profile = %profile.name, "profile has no cron expression; not scheduled");
            continue;
        };
        let pipeline = Arc::new(RankedStatsPipeline::from_config(config, profile)?);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        profile = %summary.profile,
                        published = summary.published_results,
                        "scheduled run complete"
                    ),
                    Err(err) => error!(
                        profile = %pipeline.profile().name,
                        error = %err,
                        "scheduled run failed"
                    ),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        scheduled += 1;
    }
    if scheduled == 0 {
        bail!("no profile declares a cron expression");
    }
    Ok(sched)
}

/// Run scheduled jobs until ctrl-c.
pub async fn run_scheduler_from_env() -> Result<()> {
    run_scheduler(JobConfig::from_env()?).await
}

pub async fn run_scheduler(config: JobConfig) -> Result<()> {
    if !config.scheduler_enabled {
        bail!("scheduler disabled: set RDSTATS_SCHEDULER_ENABLED=1");
    }
    let mut sched = build_scheduler(&config, config.profiles().await?).await?;
    sched.start().await.context("starting scheduler")?;
    info!("scheduler started");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rdstats_adapters::{
        CardRef, DecodedDeck, DeckDecodeError, ReferenceCard, ReferenceCardCatalog,
    };
    use rdstats_core::PatchInfo;
    use rdstats_storage::{read_snapshot, MemorySnapshotStore, SnapshotObject, StoreError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn patch_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 4, 6, 17, 0, 0).single().unwrap()
    }

    struct FixedPatch(Option<PatchInfo>);

    #[async_trait]
    impl PatchSource for FixedPatch {
        async fn resolve(&self, _run_id: Uuid) -> Result<PatchInfo, PatchError> {
            self.0.clone().ok_or(PatchError::NotFound { number: 88998 })
        }
    }

    fn current_patch() -> FixedPatch {
        FixedPatch(Some(PatchInfo {
            number: 88998,
            version: "20.0.2".into(),
            name: "Barrens balance changes".into(),
            date: patch_date(),
        }))
    }

    struct FixedRows {
        rows: Result<Vec<MatchRow>, ()>,
        since: Arc<Mutex<Option<DateTime<Utc>>>>,
    }

    impl FixedRows {
        fn ok(rows: Vec<MatchRow>) -> Self {
            Self {
                rows: Ok(rows),
                since: Arc::default(),
            }
        }

        fn failing() -> Self {
            Self {
                rows: Err(()),
                since: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl MatchRowSource for FixedRows {
        async fn fetch_rows(
            &self,
            _run_id: Uuid,
            since: DateTime<Utc>,
        ) -> Result<Vec<MatchRow>, QueryError> {
            *self.since.lock().unwrap() = Some(since);
            self.rows
                .clone()
                .map_err(|_| QueryError::Connect(sqlx::Error::PoolTimedOut))
        }
    }

    struct FixedCards {
        fail: bool,
        loads: Arc<AtomicUsize>,
    }

    impl FixedCards {
        fn ok() -> Self {
            Self {
                fail: false,
                loads: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl CardCatalogSource for FixedCards {
        async fn load(&self, _run_id: Uuid) -> Result<ReferenceCardCatalog, CatalogError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CatalogError::Empty);
            }
            Ok(ReferenceCardCatalog::from_cards([
                ReferenceCard {
                    id: "CS2_029".into(),
                    dbf_id: Some(315),
                    name: Some("Fireball".into()),
                },
                ReferenceCard {
                    id: "CS2_023".into(),
                    dbf_id: Some(555),
                    name: Some("Arcane Intellect".into()),
                },
            ]))
        }
    }

    /// Deckstrings are `dbf:copies` lists; anything unparseable fails.
    struct ListCodec;

    impl DeckCodec for ListCodec {
        fn decode(&self, deckstring: &str) -> Result<DecodedDeck, DeckDecodeError> {
            let mut cards = Vec::new();
            for part in deckstring.split(',') {
                let (id, copies) = part.split_once(':').ok_or(DeckDecodeError::Empty)?;
                let id = id.parse::<u32>().map_err(|_| DeckDecodeError::Overflow)?;
                let copies = copies.parse::<u32>().map_err(|_| DeckDecodeError::Overflow)?;
                cards.push((CardRef::DbfId(id), copies));
            }
            Ok(DecodedDeck {
                format: 2,
                heroes: vec![637],
                cards,
            })
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl SnapshotStore for BrokenStore {
        async fn put_object(&self, object: &SnapshotObject) -> Result<(), StoreError> {
            Err(StoreError::HttpStatus {
                status: 503,
                url: object.destination.to_string(),
            })
        }

        async fn get_object(
            &self,
            _bucket: &str,
            _key: &str,
        ) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }
    }

    fn row(format: GameFormat, archetype: &str, deck: &str, wins: u64, losses: u64) -> MatchRow {
        MatchRow {
            game_format: format,
            archetype_id: archetype.into(),
            deckstring: deck.into(),
            wins,
            losses,
        }
    }

    fn pipeline(
        profile: JobProfile,
        patches: FixedPatch,
        rows: FixedRows,
        cards: FixedCards,
        store: Arc<dyn SnapshotStore>,
    ) -> RankedStatsPipeline {
        let destination = SnapshotDestination::gzip_json(DEFAULT_BUCKET, profile.key.clone());
        RankedStatsPipeline::new(
            profile,
            Box::new(patches),
            Box::new(rows),
            Box::new(cards),
            SnapshotPublisher::new(store, destination),
        )
        .with_codec(Arc::new(ListCodec))
    }

    #[tokio::test]
    async fn undecodable_deck_is_left_out_but_counted() {
        let store = Arc::new(MemorySnapshotStore::new());
        let rows = FixedRows::ok(vec![
            row(GameFormat::Standard, "A", "315:2,555:1", 5, 2),
            row(GameFormat::Standard, "A", "garbage", 3, 1),
        ]);
        let since = rows.since.clone();
        let job = pipeline(
            JobProfile::ranked_decks(),
            current_patch(),
            rows,
            FixedCards::ok(),
            store.clone(),
        );

        let summary = job.run_once().await.expect("run");
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.published_results, 1);
        assert_eq!(summary.undecodable_decks, 1);
        assert_eq!(summary.destination, "static.zerotoheroes.com/api/ranked-decks.json");
        assert_eq!(*since.lock().unwrap(), Some(patch_date()));

        let stats = read_snapshot(store.as_ref(), job.publisher().destination())
            .await
            .expect("read")
            .expect("published");
        assert_eq!(stats.last_patch.len(), 1);
        let result = &stats.last_patch[0];
        assert_eq!((result.wins, result.losses), (8, 3));
        assert_eq!(result.decklists.len(), 1);
        assert_eq!(
            result.decklists[0].cards.as_deref(),
            Some(&["CS2_029".to_string(), "CS2_029".to_string(), "CS2_023".to_string()][..])
        );
    }

    #[tokio::test]
    async fn lightweight_profile_skips_cards_and_uses_its_threshold() {
        let store = Arc::new(MemorySnapshotStore::new());
        let cards = FixedCards {
            fail: true,
            loads: Arc::default(),
        };
        let loads = cards.loads.clone();
        let rows = FixedRows::ok(vec![
            row(GameFormat::Standard, "A", "d1", 5, 2),
            row(GameFormat::Standard, "A", "d2", 3, 1),
            row(GameFormat::Wild, "B", "d3", 40, 20),
        ]);
        let job = pipeline(
            JobProfile::ranked_archetypes(),
            current_patch(),
            rows,
            cards,
            store.clone(),
        );

        let summary = job.run_once().await.expect("run");
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert_eq!(summary.groups, 2);
        assert_eq!(summary.published_results, 1);

        let stats = read_snapshot(store.as_ref(), job.publisher().destination())
            .await
            .expect("read")
            .expect("published");
        assert_eq!(stats.last_patch[0].archetype_id, "B");
        assert!(stats.last_patch[0].decklists.iter().all(|d| d.cards.is_none()));
    }

    #[tokio::test]
    async fn everything_below_threshold_still_publishes_an_empty_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        let rows = FixedRows::ok(vec![row(GameFormat::Standard, "A", "d1", 5, 2)]);
        let job = pipeline(
            JobProfile::ranked_archetypes(),
            current_patch(),
            rows,
            FixedCards::ok(),
            store.clone(),
        );

        job.run_once().await.expect("run");
        let stats = read_snapshot(store.as_ref(), job.publisher().destination())
            .await
            .expect("read")
            .expect("published");
        assert!(stats.last_patch.is_empty());
    }

    #[tokio::test]
    async fn missing_patch_aborts_before_query() {
        let store = Arc::new(MemorySnapshotStore::new());
        let rows = FixedRows::ok(vec![]);
        let since = rows.since.clone();
        let job = pipeline(
            JobProfile::ranked_decks(),
            FixedPatch(None),
            rows,
            FixedCards::ok(),
            store.clone(),
        );

        let err = job.run_once().await.expect_err("should fail");
        assert!(matches!(err, JobError::PatchNotFound(88998)));
        assert_eq!(err.stage(), PipelineStage::ResolvePatch);
        assert!(since.lock().unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn query_failure_publishes_nothing() {
        let store = Arc::new(MemorySnapshotStore::new());
        let job = pipeline(
            JobProfile::ranked_decks(),
            current_patch(),
            FixedRows::failing(),
            FixedCards::ok(),
            store.clone(),
        );

        let err = job.run_once().await.expect_err("should fail");
        assert_eq!(err.stage(), PipelineStage::Query);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn card_catalog_failure_is_an_upstream_error() {
        let store = Arc::new(MemorySnapshotStore::new());
        let cards = FixedCards {
            fail: true,
            loads: Arc::default(),
        };
        let rows = FixedRows::ok(vec![row(GameFormat::Standard, "A", "315:1", 30, 20)]);
        let job = pipeline(JobProfile::ranked_decks(), current_patch(), rows, cards, store.clone());

        let err = job.run_once().await.expect_err("should fail");
        assert!(matches!(err, JobError::UpstreamFetch { what: "reference cards", .. }));
        assert_eq!(err.stage(), PipelineStage::Transform);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn storage_failure_fails_the_run() {
        let rows = FixedRows::ok(vec![row(GameFormat::Standard, "A", "315:1", 30, 20)]);
        let job = pipeline(
            JobProfile::ranked_decks(),
            current_patch(),
            rows,
            FixedCards::ok(),
            Arc::new(BrokenStore),
        );

        let err = job.run_once().await.expect_err("should fail");
        assert!(matches!(err, JobError::Publish(PublishError::Store(_))));
        assert_eq!(err.stage(), PipelineStage::Publish);
    }

    #[test]
    fn builtin_profiles_keep_their_own_thresholds() {
        let decks = JobProfile::builtin("ranked-decks").unwrap();
        let archetypes = JobProfile::builtin("ranked-archetypes").unwrap();
        assert_eq!((decks.threshold, decks.include_cards), (10, true));
        assert_eq!((archetypes.threshold, archetypes.include_cards), (50, false));
        assert!(JobProfile::builtin("battlegrounds").is_none());
    }

    fn workspace_profiles_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../profiles.yaml")
    }

    #[tokio::test]
    async fn workspace_profiles_file_parses() {
        let profiles = load_profiles(&workspace_profiles_path()).await.expect("profiles");
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0], JobProfile {
            cron: Some("0 15 */2 * * *".into()),
            ..JobProfile::ranked_decks()
        });
        assert_eq!(profiles[1].threshold, 50);
    }

    #[test]
    fn empty_profiles_file_is_rejected() {
        assert!(parse_profiles_yaml("profiles: []").is_err());
    }

    #[test]
    fn column_values_become_rows() {
        let row = match_row_from_columns(
            Some("standard"),
            Some("77".into()),
            Some("AAEC".into()),
            4,
            -1,
        )
        .expect("row");
        assert_eq!(row.game_format, GameFormat::Standard);
        assert_eq!((row.wins, row.losses), (4, 0));

        assert!(match_row_from_columns(Some("classic"), Some("77".into()), None, 1, 1).is_none());
        assert!(match_row_from_columns(None, Some("77".into()), None, 1, 1).is_none());
        assert!(match_row_from_columns(Some("wild"), None, None, 1, 1).is_none());
    }

    #[test]
    fn datetime_literal_matches_column_precision() {
        assert_eq!(sql_datetime_literal(patch_date()), "2021-04-06 17:00:00.000000");
    }

    fn local_config(output_dir: &Path) -> JobConfig {
        JobConfig {
            database_url: "mysql://localhost/test".into(),
            patches_url: DEFAULT_PATCHES_URL.into(),
            cards_url: DEFAULT_CARDS_URL.into(),
            cards_path: None,
            profile: JobProfile::ranked_decks(),
            bucket: DEFAULT_BUCKET.into(),
            store_endpoint: None,
            output_dir: Some(output_dir.to_path_buf()),
            scheduler_enabled: false,
            profiles_file: None,
            user_agent: "rdstats-test".into(),
            http_timeout_secs: 5,
            bind_addr: "127.0.0.1:0".into(),
        }
    }

    #[tokio::test]
    async fn config_builds_filesystem_store_for_output_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = local_config(dir.path());
        let store = config.snapshot_store().expect("store");
        let destination = config.destination_for(&config.profile);
        store
            .put_object(&SnapshotObject {
                destination: destination.clone(),
                body: b"payload".to_vec(),
            })
            .await
            .expect("put");
        assert!(dir.path().join("static.zerotoheroes.com/api/ranked-decks.json").exists());

        let no_store = JobConfig {
            output_dir: None,
            ..config
        };
        assert!(no_store.snapshot_store().is_err());
    }

    #[tokio::test]
    async fn config_reads_profiles_file_when_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = local_config(dir.path());
        assert_eq!(config.profiles().await.expect("profiles"), vec![JobProfile::ranked_decks()]);

        config.profiles_file = Some(workspace_profiles_path());
        assert_eq!(config.profiles().await.expect("profiles").len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_registers_profiles_with_cron() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = local_config(dir.path());
        let profiles = load_profiles(&workspace_profiles_path()).await.expect("profiles");
        build_scheduler(&config, profiles).await.expect("scheduler");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_without_any_cron_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = local_config(dir.path());
        let profiles = vec![JobProfile::ranked_decks(), JobProfile::ranked_archetypes()];
        let err = build_scheduler(&config, profiles)
            .await
            .err().expect("nothing to schedule");
        assert_eq!(err.to_string(), "no profile declares a cron expression");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_reports_invalid_cron() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = local_config(dir.path());
        let profile = JobProfile {
            cron: Some("every other tuesday".into()),
            ..JobProfile::ranked_decks()
        };
        let err = build_scheduler(&config, vec![profile])
            .await
            .err().expect("invalid cron");
        assert_eq!(err.to_string(), "creating scheduler job for cron every other tuesday");
    }

    struct FakeConnection {
        fail: bool,
        released: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MatchRowConnection for FakeConnection {
        async fn match_rows(
            &mut self,
            _since: DateTime<Utc>,
        ) -> Result<Vec<MatchRow>, sqlx::Error> {
            if self.fail {
                return Err(sqlx::Error::RowNotFound);
            }
            Ok(vec![row(GameFormat::Wild, "A", "d1", 1, 1)])
        }

        async fn release(self) -> Result<(), sqlx::Error> {
            self.released.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn connection_is_released_after_failed_query() {
        let released = Arc::new(AtomicBool::new(false));
        let conn = FakeConnection {
            fail: true,
            released: released.clone(),
        };
        let err = fetch_then_release(Uuid::new_v4(), conn, patch_date())
            .await
            .expect_err("query fails");
        assert!(matches!(err, QueryError::Query(sqlx::Error::RowNotFound)));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn connection_is_released_after_successful_query() {
        let released = Arc::new(AtomicBool::new(false));
        let conn = FakeConnection {
            fail: false,
            released: released.clone(),
        };
        let rows = fetch_then_release(Uuid::new_v4(), conn, patch_date())
            .await
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert!(released.load(Ordering::SeqCst));
    }
}
