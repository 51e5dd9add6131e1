use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use neows_core::Secret;
use neows_storage::{
    ArchiveError, BlobSink, FeedClientConfig, FsBlobSink, S3BlobSink, S3Config, DEFAULT_FEED_URL,
};
use sqlx::postgres::PgConnectOptions;

use crate::store::StoreError;

pub const DEFAULT_SCHEDULE_CRON: &str = "0 0 6 * * *";

#[derive(Debug, Clone)]
pub struct NeowsConfig {
    pub feed: FeedClientConfig,
    pub database: DatabaseConfig,
    pub archive: ArchiveConfig,
    pub schedule_cron: String,
}

impl NeowsConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let text = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let timeout = Duration::from_secs(
            var("NEOWS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        );

        let feed = FeedClientConfig {
            feed_url: text("NEOWS_FEED_URL", DEFAULT_FEED_URL),
            api_key: text("NASA_API_KEY", "DEMO_KEY"),
            timeout,
            user_agent: Some(text("NEOWS_USER_AGENT", "neows-etl/0.1")),
        };

        let database = DatabaseConfig {
            url: var("DATABASE_URL").map(Secret::new),
            host: text("DB_HOST", "localhost"),
            port: var("DB_PORT").and_then(|v| v.parse().ok()).unwrap_or(5432),
            user: text("DB_USER", "admin"),
            password: Secret::new(text("DB_PASSWORD", "admin")),
            name: text("DB_NAME", "nasa_neows_db"),
            schema: var("DB_SCHEMA"),
        };

        let archive = match var("NEOWS_ARCHIVE_BACKEND").as_deref() {
            Some("fs") => ArchiveConfig::Fs {
                root: PathBuf::from(text("NEOWS_ARCHIVE_DIR", "./archive")),
            },
            _ => ArchiveConfig::S3(S3Config {
                bucket: text("AWS_BUCKET_NAME", "nasa-neows-data-bucket"),
                region: text("AWS_REGION", "us-east-1"),
                access_key: Secret::new(text("AWS_ACCESS_KEY", "")),
                secret_key: Secret::new(text("AWS_SECRET_KEY", "")),
                endpoint: var("AWS_ENDPOINT_URL"),
                timeout,
            }),
        };

        Self {
            feed,
            database,
            archive,
            schedule_cron: text("NEOWS_SCHEDULE_CRON", DEFAULT_SCHEDULE_CRON),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Full connection URL; when present it wins over the individual parts.
    pub url: Option<Secret>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret,
    pub name: String,
    /// Optional namespace for the three tables.
    pub schema: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            user: "admin".to_string(),
            password: Secret::new("admin"),
            name: "nasa_neows_db".to_string(),
            schema: None,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions, StoreError> {
        if let Some(url) = &self.url {
            return Ok(PgConnectOptions::from_str(url.expose())?);
        }
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(self.password.expose())
            .database(&self.name))
    }
}

#[derive(Debug, Clone)]
pub enum ArchiveConfig {
    Fs { root: PathBuf },
    S3(S3Config),
}

impl ArchiveConfig {
    pub async fn build_sink(&self) -> Result<Box<dyn BlobSink>, ArchiveError> {
        match self {
            Self::Fs { root } => Ok(Box::new(FsBlobSink::new(root.clone()))),
            Self::S3(config) => Ok(Box::new(S3BlobSink::new(config.clone()).await?)),
        }
    }
}
