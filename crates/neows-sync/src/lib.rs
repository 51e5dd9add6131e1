//! NeoWs pipeline orchestration: fetch, archive, transform, persist.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use neows_core::RawFeedDocument;
use neows_storage::{ArchiveError, FeedClient, FetchError, RawArchiver};
use neows_transform::{extract_close_approaches, flatten_feed, normalize_names};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod persist;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{ArchiveConfig, DatabaseConfig, NeowsConfig};
pub use persist::{persist_records, PersistReport};
pub use store::{NeoStore, PgStore, StoreError};

pub const CRATE_NAME: &str = "neows-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// The feed was transformed and written.
    Loaded,
    /// Nothing usable came back from the feed.
    NoData,
    /// The payload failed validation; nothing was written.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadOutcome {
    pub status: LoadStatus,
    pub element_count: Option<u64>,
    pub rejection: Option<String>,
    pub persisted: PersistReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingestion_date: NaiveDate,
    pub archived_to: Option<String>,
    #[serde(flatten)]
    pub load: LoadOutcome,
}

pub struct NeowsPipeline {
    feed: FeedClient,
    archiver: RawArchiver,
    database: DatabaseConfig,
}

impl NeowsPipeline {
    pub async fn new(config: &NeowsConfig) -> Result<Self> {
        let feed = FeedClient::new(config.feed.clone())?;
        let sink = config
            .archive
            .build_sink()
            .await
            .context("configuring raw archive")?;
        Ok(Self::from_parts(feed, RawArchiver::new(sink), config.database.clone()))
    }

    pub fn from_parts(feed: FeedClient, archiver: RawArchiver, database: DatabaseConfig) -> Self {
        Self {
            feed,
            archiver,
            database,
        }
    }

    /// One full pass against Postgres. The connection is opened first and
    /// closed on every exit path.
    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        let mut store = PgStore::connect(&self.database).await?;
        let result = self.run_with_store(&mut store).await;
        let closed = store.close().await;

        match (result, closed) {
            (Ok(summary), Ok(())) => Ok(summary),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), closed) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "closing postgres connection after failed run");
                }
                Err(err)
            }
        }
    }

    pub async fn run_with_store(&self, store: &mut dyn NeoStore) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let ingestion_date = started_at.date_naive();
        let span = info_span!("neows_run", %run_id, %ingestion_date);

        async {
            store.ensure_schema().await?;

            let mut document = self.feed.fetch_feed(run_id, ingestion_date).await?;
            let archived = self.archiver.archive(document.as_mut(), ingestion_date).await?;
            let load = process_document(document.as_ref(), store).await?;

            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                ingestion_date,
                archived_to: archived.map(|stored| stored.location),
                load,
            };
            info!(
                status = ?summary.load.status,
                objects = summary.load.persisted.objects_upserted,
                approaches = summary.load.persisted.approaches_inserted,
                skipped = summary.load.persisted.approaches_skipped,
                "run complete"
            );
            Ok::<_, PipelineError>(summary)
        }
        .instrument(span)
        .await
    }
}

/// Transform a feed document and write it through `store`.
///
/// Payload problems are not errors here: they are logged and reported in the
/// outcome with nothing written. Only store failures propagate.
pub async fn process_document(
    document: Option<&RawFeedDocument>,
    store: &mut dyn NeoStore,
) -> Result<LoadOutcome, StoreError> {
    let transformed = flatten_feed(document).and_then(|mut flattened| {
        let element_count = flattened.count;
        normalize_names(&mut flattened.objects);
        extract_close_approaches(flattened).map(|extracted| (element_count, extracted))
    });

    let (element_count, extracted) = match transformed {
        Ok(parts) => parts,
        Err(err) => {
            warn!(error = %err, "feed payload rejected; nothing will be written");
            return Ok(LoadOutcome {
                status: LoadStatus::Rejected,
                element_count: None,
                rejection: Some(err.to_string()),
                persisted: PersistReport::default(),
            });
        }
    };

    if extracted.objects.is_empty() {
        warn!("no near-earth objects in feed; nothing to write");
        return Ok(LoadOutcome {
            status: LoadStatus::NoData,
            element_count,
            rejection: None,
            persisted: PersistReport::default(),
        });
    }

    let persisted = persist_records(store, &extracted).await?;
    Ok(LoadOutcome {
        status: LoadStatus::Loaded,
        element_count,
        rejection: None,
        persisted,
    })
}

/// Create tables and indexes without running the pipeline.
pub async fn bootstrap_schema(database: &DatabaseConfig) -> Result<(), StoreError> {
    let mut store = PgStore::connect(database).await?;
    let result = store.ensure_schema().await;
    let closed = store.close().await;
    result.and(closed)
}

/// Serializes scheduled runs: a trigger that finds a run in flight is skipped.
#[derive(Debug, Clone, Default)]
pub struct RunGate {
    inner: Arc<Mutex<()>>,
}

impl RunGate {
    pub fn try_enter(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.inner).try_lock_owned().ok()
    }
}

pub async fn build_scheduler(pipeline: Arc<NeowsPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = RunGate::default();

    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let gate = gate.clone();
        Box::pin(async move {
            let Some(_guard) = gate.try_enter() else {
                warn!("previous run still in progress; skipping scheduled trigger");
                return;
            };
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled run finished"),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use neows_core::Secret;
    use neows_storage::{FeedClientConfig, FsBlobSink, S3BlobSink, S3Config};
    use neows_transform::load_feed_document;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn sample_document() -> RawFeedDocument {
        load_feed_document(workspace_root().join("fixtures/feed/sample.json"))
            .expect("load sample feed")
            .expect("sample feed is an object")
    }

    fn header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
    }

    /// Reads until the request head and any declared body have arrived.
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.expect("read request");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = header_end(&buf) else { continue };
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let declared = head.lines().find_map(|line| {
                line.strip_prefix("content-length:")
                    .and_then(|v| v.trim().parse::<usize>().ok())
            });
            let complete = match declared {
                Some(len) => buf.len() >= end + len,
                None if head.contains("transfer-encoding: chunked") => {
                    buf.len() > end && buf.ends_with(b"\r\n\r\n")
                }
                None => true,
            };
            if complete {
                break;
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Serves one canned HTTP response and hands back the request line.
    async fn serve_at(
        status: &'static str,
        content_type: &'static str,
        body: String,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write response");
            socket.shutdown().await.ok();
            request.lines().next().unwrap_or_default().to_string()
        });
        (format!("http://{addr}"), handle)
    }

    async fn serve_once(status: &'static str, body: String) -> (String, tokio::task::JoinHandle<String>) {
        let (base, handle) = serve_at(status, "application/json", body).await;
        (format!("{base}/neo/rest/v1/feed"), handle)
    }

    fn feed_client(feed_url: String) -> FeedClient {
        FeedClient::new(FeedClientConfig {
            feed_url,
            api_key: "test-key".into(),
            timeout: Duration::from_secs(5),
            user_agent: None,
        })
        .expect("feed client")
    }

    fn pipeline(feed_url: String, archive_root: &Path) -> NeowsPipeline {
        NeowsPipeline::from_parts(
            feed_client(feed_url),
            RawArchiver::new(Box::new(FsBlobSink::new(archive_root))),
            DatabaseConfig::default(),
        )
    }

    #[tokio::test]
    async fn full_run_fetches_archives_and_persists() {
        let body = serde_json::to_string(&sample_document()).unwrap();
        let (url, server) = serve_once("200 OK", body).await;
        let archive = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();

        let summary = pipeline(url, archive.path())
            .run_with_store(&mut store)
            .await
            .expect("run");

        let request_line = server.await.unwrap();
        assert!(request_line.contains("api_key=test-key"));
        assert!(request_line.contains(&format!("start_date={}", summary.ingestion_date)));

        assert_eq!(store.schema_bootstraps, 1);
        assert_eq!(summary.load.status, LoadStatus::Loaded);
        assert_eq!(summary.load.element_count, Some(3));
        assert_eq!(summary.load.persisted.objects_upserted, 3);
        assert_eq!(summary.load.persisted.approaches_inserted, 4);

        let archived_to = summary.archived_to.expect("archived");
        let archived: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&archived_to).unwrap()).unwrap();
        assert_eq!(archived["status"], "raw");
        assert_eq!(archived["ingestion_date"], summary.ingestion_date.to_string());
        assert!(archived_to.ends_with(&format!("{}.json", summary.ingestion_date)));
    }

    #[tokio::test]
    async fn error_status_is_no_data_and_run_succeeds() {
        let (url, server) = serve_once("429 Too Many Requests", "{\"error\":\"OVER_RATE_LIMIT\"}".into()).await;
        let archive = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();

        let summary = pipeline(url, archive.path())
            .run_with_store(&mut store)
            .await
            .expect("run");
        server.await.unwrap();

        assert_eq!(summary.load.status, LoadStatus::NoData);
        assert!(summary.archived_to.is_none());
        assert!(store.objects.is_empty());
        assert!(!archive.path().join("raw-neo").exists());
    }

    #[tokio::test]
    async fn unreachable_feed_degrades_to_no_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let archive = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        let summary = pipeline(format!("http://{addr}/feed"), archive.path())
            .run_with_store(&mut store)
            .await
            .expect("run");
        assert_eq!(summary.load.status, LoadStatus::NoData);
        assert!(summary.archived_to.is_none());
        assert!(store.objects.is_empty());
    }

    #[tokio::test]
    async fn archive_failure_aborts_before_any_write() {
        let body = serde_json::to_string(&sample_document()).unwrap();
        let (url, server) = serve_once("200 OK", body).await;
        let archive = tempfile::tempdir().unwrap();
        // a regular file where the archive directory should be
        let blocked = archive.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let mut store = MemoryStore::default();

        let err = pipeline(url, &blocked)
            .run_with_store(&mut store)
            .await
            .unwrap_err();
        server.await.unwrap();

        assert!(matches!(err, PipelineError::Archive(_)));
        assert!(store.objects.is_empty());
        assert!(store.approaches.is_empty());
    }

    #[tokio::test]
    async fn object_store_denial_aborts_the_run() {
        let body = serde_json::to_string(&sample_document()).unwrap();
        let (url, feed_server) = serve_once("200 OK", body).await;
        let (endpoint, s3_server) = serve_at(
            "403 Forbidden",
            "application/xml",
            "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>".into(),
        )
        .await;
        let sink = S3BlobSink::new(S3Config {
            bucket: "nasa-neows-data-bucket".into(),
            region: "us-east-1".into(),
            access_key: Secret::new("AKIDEXAMPLE"),
            secret_key: Secret::new("example-secret"),
            endpoint: Some(endpoint),
            timeout: Duration::from_secs(5),
        })
        .await
        .expect("s3 sink");
        let pipeline = NeowsPipeline::from_parts(
            feed_client(url),
            RawArchiver::new(Box::new(sink)),
            DatabaseConfig::default(),
        );
        let mut store = MemoryStore::default();

        let err = pipeline.run_with_store(&mut store).await.unwrap_err();
        feed_server.await.unwrap();
        let put_line = s3_server.await.unwrap();

        assert!(put_line.starts_with("PUT /nasa-neows-data-bucket/raw-neo/"), "{put_line}");
        assert!(
            matches!(
                err,
                PipelineError::Archive(ArchiveError::ObjectStore { status: Some(403), .. })
            ),
            "unexpected error {err:?}"
        );
        assert_eq!(store.schema_bootstraps, 1);
        assert!(store.objects.is_empty());
        assert!(store.approaches.is_empty());
    }

    #[tokio::test]
    async fn rerunning_a_snapshot_reuses_bodies_and_doubles_approaches() {
        let doc = sample_document();
        let mut store = MemoryStore::default();

        let first = process_document(Some(&doc), &mut store).await.unwrap();
        let second = process_document(Some(&doc), &mut store).await.unwrap();

        assert_eq!(first.persisted.approaches_inserted, 4);
        assert_eq!(second.persisted.approaches_inserted, 4);
        assert_eq!(store.objects.len(), 3);
        assert_eq!(store.body_names(), vec!["Earth", "Mars"]);
        assert_eq!(store.approaches.len(), 8);
        assert_eq!(store.objects[&2_465_633].clean_name, "2009 JR5");
    }

    #[tokio::test]
    async fn unresolved_body_only_drops_its_approach() {
        let doc = sample_document();
        let mut store = MemoryStore::default().with_unresolvable("Mars");

        let outcome = process_document(Some(&doc), &mut store).await.unwrap();
        assert_eq!(outcome.status, LoadStatus::Loaded);
        assert_eq!(outcome.persisted.approaches_inserted, 3);
        assert_eq!(outcome.persisted.approaches_skipped, 1);
        assert_eq!(store.approaches.len(), 3);
    }

    #[tokio::test]
    async fn absent_document_writes_nothing() {
        let mut store = MemoryStore::default();
        let outcome = process_document(None, &mut store).await.unwrap();
        assert_eq!(outcome.status, LoadStatus::NoData);
        assert_eq!(outcome.persisted, PersistReport::default());
        assert!(store.objects.is_empty());
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_without_writes() {
        let doc = RawFeedDocument::from_value(json!({
            "element_count": 1,
            "near_earth_objects": {"2026-10-19": [{"neo_reference_id": "1", "name": "Ceres"}]}
        }))
        .unwrap();
        let mut store = MemoryStore::default();

        let outcome = process_document(Some(&doc), &mut store).await.unwrap();
        assert_eq!(outcome.status, LoadStatus::Rejected);
        assert!(outcome.rejection.unwrap().contains("missing field"));
        assert!(store.objects.is_empty());
        assert!(store.approaches.is_empty());
    }

    #[test]
    fn run_gate_admits_one_run_at_a_time() {
        let gate = RunGate::default();
        let first = gate.try_enter().expect("first run enters");
        assert!(gate.clone().try_enter().is_none());
        drop(first);
        assert!(gate.try_enter().is_some());
    }

    #[tokio::test]
    async fn scheduler_accepts_default_cron_and_rejects_garbage() {
        let archive = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline("http://127.0.0.1:1/feed".into(), archive.path()));

        assert!(build_scheduler(Arc::clone(&pipeline), config::DEFAULT_SCHEDULE_CRON)
            .await
            .is_ok());
        assert!(build_scheduler(pipeline, "every morning").await.is_err());
    }

    #[test]
    fn summary_serializes_flat() {
        let summary = RunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            ingestion_date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            archived_to: None,
            load: LoadOutcome {
                status: LoadStatus::NoData,
                element_count: None,
                rejection: None,
                persisted: PersistReport::default(),
            },
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["status"], "no_data");
        assert_eq!(value["ingestion_date"], "2026-10-19");
        assert_eq!(value["persisted"]["objects_upserted"], 0);
    }
}
