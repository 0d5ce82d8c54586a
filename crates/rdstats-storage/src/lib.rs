//! HTTP fetch utility, snapshot stores, and the gzip snapshot publisher.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rdstats_core::ArchetypeStats;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rdstats-storage";

pub const DEFAULT_BUCKET: &str = "static.zerotoheroes.com";
pub const DEFAULT_KEY: &str = "api/ranked-decks.json";
pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const GZIP_CONTENT_ENCODING: &str = "gzip";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

impl HttpClientConfig {
    fn builder(&self) -> reqwest::ClientBuilder {
        let builder = reqwest::Client::builder().timeout(self.timeout);
        match &self.user_agent {
            Some(user_agent) => builder.user_agent(user_agent.clone()),
            None => builder,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed json from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Single-attempt GET client. Failures are reported, never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = config
            .builder()
            .gzip(true)
            .brotli(true)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_once(url).instrument(span).await
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        info!(bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<T, FetchError> {
        let fetched = self.fetch_bytes(run_id, url).await?;
        serde_json::from_slice(&fetched.body).map_err(|source| FetchError::Json {
            url: fetched.final_url,
            source,
        })
    }
}

/// Fixed well-known location a snapshot is written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDestination {
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub content_encoding: String,
}

impl SnapshotDestination {
    pub fn gzip_json(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            content_encoding: GZIP_CONTENT_ENCODING.to_string(),
        }
    }
}

impl Default for SnapshotDestination {
    fn default() -> Self {
        Self::gzip_json(DEFAULT_BUCKET, DEFAULT_KEY)
    }
}

impl fmt::Display for SnapshotDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotObject {
    pub destination: SnapshotDestination,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("object store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("object store returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid object location `{0}`")]
    InvalidLocation(String),
}

/// Storage collaborator. Writes replace whatever sits at the destination.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn put_object(&self, object: &SnapshotObject) -> Result<(), StoreError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

fn relative_object_path(bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
    let rel = Path::new(bucket).join(key);
    let clean = !bucket.is_empty()
        && !key.is_empty()
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if clean {
        Ok(rel)
    } else {
        Err(StoreError::InvalidLocation(format!("{bucket}/{key}")))
    }
}

/// Local directory laid out as `{root}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(relative_object_path(bucket, key)?))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    /// Temp file + rename so readers see either the old or the new snapshot.
    async fn put_object(&self, object: &SnapshotObject) -> Result<(), StoreError> {
        let dest = &object.destination;
        let absolute_path = self.object_path(&dest.bucket, &dest.key)?;
        let parent = absolute_path
            .parent()
            .ok_or_else(|| StoreError::InvalidLocation(dest.to_string()))?
            .to_path_buf();
        fs::create_dir_all(&parent).await.map_err(io_err(&parent))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), object.body.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(&object.body).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: absolute_path,
                source,
            });
        }
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

/// Object store reachable over plain HTTP at `{endpoint}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct HttpSnapshotStore {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSnapshotStore {
    pub fn new(endpoint: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        // Stored bodies are already gzip; keep them byte-exact on the way back.
        let client = config
            .builder()
            .no_gzip()
            .no_brotli()
            .build()
            .context("building object store client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn object_url(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        relative_object_path(bucket, key)?;
        Ok(format!("{}/{}/{}", self.endpoint, bucket, key.trim_start_matches('/')))
    }
}

#[async_trait]
impl SnapshotStore for HttpSnapshotStore {
    async fn put_object(&self, object: &SnapshotObject) -> Result<(), StoreError> {
        let dest = &object.destination;
        let url = self.object_url(&dest.bucket, &dest.key)?;
        let resp = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, &dest.content_type)
            .header(CONTENT_ENCODING, &dest.content_encoding)
            .body(object.body.clone())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(StoreError::HttpStatus {
                status: resp.status().as_u16(),
                url,
            });
        }
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let url = self.object_url(bucket, key)?;
        let resp = self.client.get(&url).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.bytes().await?.to_vec())),
            status => Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url,
            }),
        }
    }
}

/// In-process store, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    objects: Mutex<HashMap<(String, String), SnapshotObject>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object(&self, bucket: &str, key: &str) -> Option<SnapshotObject> {
        self.objects
            .lock()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put_object(&self, object: &SnapshotObject) -> Result<(), StoreError> {
        let dest = &object.destination;
        self.objects
            .lock()
            .await
            .insert((dest.bucket.clone(), dest.key.clone()), object.clone());
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.object(bucket, key).await.map(|o| o.body))
    }
}

pub fn gzip_bytes(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 4), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn gunzip_bytes(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("serializing snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("compressing snapshot: {0}")]
    Compress(#[source] std::io::Error),
    #[error("writing snapshot: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum SnapshotReadError {
    #[error("reading snapshot: {0}")]
    Store(#[from] StoreError),
    #[error("decompressing snapshot: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("parsing snapshot: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Gzip-compressed JSON payload, ready to hand to a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSnapshot {
    pub json_bytes: usize,
    pub body: Vec<u8>,
    pub sha256: String,
}

pub fn encode_snapshot(stats: &ArchetypeStats) -> Result<EncodedSnapshot, PublishError> {
    let json = serde_json::to_vec(stats)?;
    let body = gzip_bytes(&json).map_err(PublishError::Compress)?;
    let sha256 = sha256_hex(&body);
    Ok(EncodedSnapshot {
        json_bytes: json.len(),
        body,
        sha256,
    })
}

/// Receipt for a completed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedSnapshot {
    pub destination: SnapshotDestination,
    pub json_bytes: usize,
    pub gzip_bytes: usize,
    pub sha256: String,
}

#[derive(Clone)]
pub struct SnapshotPublisher {
    store: Arc<dyn SnapshotStore>,
    destination: SnapshotDestination,
}

impl SnapshotPublisher {
    pub fn new(store: Arc<dyn SnapshotStore>, destination: SnapshotDestination) -> Self {
        Self { store, destination }
    }

    pub fn destination(&self) -> &SnapshotDestination {
        &self.destination
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn encode(&self, stats: &ArchetypeStats) -> Result<EncodedSnapshot, PublishError> {
        let encoded = encode_snapshot(stats)?;
        info!(
            results = stats.last_patch.len(),
            json_bytes = encoded.json_bytes,
            gzip_bytes = encoded.body.len(),
            sha256 = %encoded.sha256,
            "encoded snapshot"
        );
        Ok(encoded)
    }

    pub async fn publish_encoded(
        &self,
        encoded: EncodedSnapshot,
    ) -> Result<PublishedSnapshot, PublishError> {
        let EncodedSnapshot {
            json_bytes,
            body,
            sha256,
        } = encoded;
        let gzip_bytes = body.len();
        let object = SnapshotObject {
            destination: self.destination.clone(),
            body,
        };
        self.store.put_object(&object).await?;
        info!(destination = %self.destination, gzip_bytes, "snapshot saved");
        Ok(PublishedSnapshot {
            destination: self.destination.clone(),
            json_bytes,
            gzip_bytes,
            sha256,
        })
    }

    pub async fn publish(&self, stats: &ArchetypeStats) -> Result<PublishedSnapshot, PublishError> {
        let encoded = self.encode(stats)?;
        self.publish_encoded(encoded).await
    }
}

/// Fetch and gunzip a published snapshot. `Ok(None)` when nothing has been published yet.
pub async fn read_snapshot(
    store: &dyn SnapshotStore,
    destination: &SnapshotDestination,
) -> Result<Option<ArchetypeStats>, SnapshotReadError> {
    let Some(body) = store.get_object(&destination.bucket, &destination.key).await? else {
        return Ok(None);
    };
    let json = gunzip_bytes(&body).map_err(SnapshotReadError::Decompress)?;
    Ok(Some(serde_json::from_slice(&json)?))
}
