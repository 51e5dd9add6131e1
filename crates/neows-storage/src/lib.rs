//! Feed fetch + raw document archive utilities for the NeoWs pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use neows_core::RawFeedDocument;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod s3;

pub use s3::{S3BlobSink, S3Config};

pub const CRATE_NAME: &str = "neows-storage";

pub const DEFAULT_FEED_URL: &str = "https://api.nasa.gov/neo/rest/v1/feed";

/// Key prefix for archived raw feed documents.
pub const ARCHIVE_PREFIX: &str = "raw-neo";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Date-partitioned archive key, e.g. `raw-neo/2026-10-19.json`.
pub fn archive_key(ingestion_date: NaiveDate) -> String {
    format!("{ARCHIVE_PREFIX}/{}.json", ingestion_date.format("%Y-%m-%d"))
}

#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    pub feed_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            api_key: "DEMO_KEY".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid feed request: {0}")]
    Request(#[from] reqwest::Error),
}

/// Client for the NeoWs `feed` endpoint. One request per run, no retries.
#[derive(Debug)]
pub struct FeedClient {
    client: reqwest::Client,
    feed_url: String,
    api_key: String,
}

impl FeedClient {
    pub fn new(config: FeedClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            feed_url: config.feed_url,
            api_key: config.api_key,
        })
    }

    fn build_request(&self, start_date: NaiveDate) -> Result<reqwest::Request, reqwest::Error> {
        let start_date = start_date.format("%Y-%m-%d").to_string();
        self.client
            .get(&self.feed_url)
            .query(&[("api_key", self.api_key.as_str()), ("start_date", start_date.as_str())])
            .build()
    }

    /// Fetch the feed window starting at `start_date`.
    ///
    /// Only a request that cannot be built is an error. Transport failures,
    /// non-success statuses and unusable bodies are logged and reported as
    /// `Ok(None)`, i.e. "no data".
    pub async fn fetch_feed(
        &self,
        run_id: Uuid,
        start_date: NaiveDate,
    ) -> Result<Option<RawFeedDocument>, FetchError> {
        let span = info_span!("feed_fetch", %run_id, %start_date);
        async {
            let request = self.build_request(start_date)?;
            let resp = match self.client.execute(request).await {
                Ok(resp) => resp,
                Err(err) => {
                    error!(error = %err, "feed request failed; treating as no data");
                    return Ok(None);
                }
            };
            let status = resp.status();
            if !status.is_success() {
                warn!(status = status.as_u16(), "feed returned non-success status; treating as no data");
                return Ok(None);
            }

            let body = match resp.bytes().await {
                Ok(body) => body,
                Err(err) => {
                    error!(error = %err, "reading feed body failed; treating as no data");
                    return Ok(None);
                }
            };
            let document = parse_feed_body(&body);
            if let Some(doc) = &document {
                info!(bytes = body.len(), fields = doc.fields().len(), "fetched feed document");
            }
            Ok::<_, FetchError>(document)
        }
        .instrument(span)
        .await
    }
}

/// Parse a response body into a feed document. Invalid JSON and non-object
/// JSON both yield `None`.
pub fn parse_feed_body(body: &[u8]) -> Option<RawFeedDocument> {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => {
            let document = RawFeedDocument::from_value(value);
            if document.is_none() {
                warn!("feed body is valid JSON but not an object");
            }
            document
        }
        Err(err) => {
            error!(error = %err, "error parsing feed JSON response");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub location: String,
    pub byte_size: usize,
    pub content_hash: String,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("serializing raw document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("archive io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("object store rejected {key} (status {status:?}): {message}")]
    ObjectStore {
        key: String,
        status: Option<u16>,
        message: String,
    },
    #[error("invalid archive configuration: {0}")]
    Config(String),
}

/// Destination for archived blobs. Writes to an existing key replace it.
#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Human-readable location of the sink, used in logs.
    fn describe(&self) -> String;

    async fn put_object(
        &self,
        key: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, ArchiveError>;
}

/// Filesystem-backed sink; the root directory plays the role of the bucket.
#[derive(Debug, Clone)]
pub struct FsBlobSink {
    root: PathBuf,
}

impl FsBlobSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
        move |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl BlobSink for FsBlobSink {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    /// Write via temp file + rename so readers never see a partial document.
    async fn put_object(
        &self,
        key: &str,
        _content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, ArchiveError> {
        let absolute_path = self.root.join(key);
        let parent = absolute_path
            .parent()
            .ok_or_else(|| ArchiveError::Config(format!("archive key {key} has no parent")))?
            .to_path_buf();

        fs::create_dir_all(&parent)
            .await
            .map_err(Self::io_error(&parent))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(Self::io_error(&temp_path))?;
        file.write_all(bytes)
            .await
            .map_err(Self::io_error(&temp_path))?;
        file.flush().await.map_err(Self::io_error(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ArchiveError::Io {
                path: absolute_path,
                source,
            });
        }

        Ok(StoredObject {
            key: key.to_string(),
            location: absolute_path.display().to_string(),
            byte_size: bytes.len(),
            content_hash: sha256_hex(bytes),
        })
    }
}

/// Writes the annotated raw feed document to `raw-neo/<date>.json`.
pub struct RawArchiver {
    sink: Box<dyn BlobSink>,
}

impl RawArchiver {
    pub fn new(sink: Box<dyn BlobSink>) -> Self {
        Self { sink }
    }

    pub fn describe(&self) -> String {
        self.sink.describe()
    }

    /// Annotate `document` in place and archive it. With no data this is a
    /// logged no-op returning `Ok(None)`.
    pub async fn archive(
        &self,
        document: Option<&mut RawFeedDocument>,
        ingestion_date: NaiveDate,
    ) -> Result<Option<StoredObject>, ArchiveError> {
        let Some(document) = document.filter(|doc| !doc.is_empty()) else {
            warn!("no data to archive");
            return Ok(None);
        };

        document.annotate_for_archive(ingestion_date);
        let key = archive_key(ingestion_date);
        let body = serde_json::to_vec(&*document)?;
        info!(sink = %self.sink.describe(), %key, "uploading raw feed document");

        match self.sink.put_object(&key, "application/json", &body).await {
            Ok(stored) => {
                info!(location = %stored.location, bytes = stored.byte_size, "archived raw feed document");
                Ok(Some(stored))
            }
            Err(err) => {
                error!(error = %err, %key, "error archiving raw feed document");
                Err(err)
            }
        }
    }
}
