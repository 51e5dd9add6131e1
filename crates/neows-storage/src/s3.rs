//! S3 blob sink on the AWS SDK.
//!
//! Credentials come from the standard AWS chain (environment, profile,
//! container or instance role) unless an explicit key pair is configured.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use neows_core::Secret;
use tracing::debug;

use crate::{sha256_hex, ArchiveError, BlobSink, StoredObject};

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Explicit key pair; when both are empty the default credential chain is used.
    pub access_key: Secret,
    pub secret_key: Secret,
    /// Custom endpoint for S3-compatible stores (MinIO, LocalStack); path-style addressing.
    pub endpoint: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct S3BlobSink {
    client: Client,
    bucket: String,
}

impl S3BlobSink {
    pub async fn new(config: S3Config) -> Result<Self, ArchiveError> {
        if config.bucket.trim().is_empty() {
            return Err(ArchiveError::Config("bucket name is empty".into()));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.timeout)
                    .build(),
            );

        match (config.access_key.is_empty(), config.secret_key.is_empty()) {
            (false, false) => {
                loader = loader.credentials_provider(Credentials::new(
                    config.access_key.expose(),
                    config.secret_key.expose(),
                    None,
                    None,
                    "neows-explicit-keys",
                ));
            }
            (true, true) => debug!("no explicit s3 keys; using the default aws credential chain"),
            _ => {
                return Err(ArchiveError::Config(
                    "AWS_ACCESS_KEY and AWS_SECRET_KEY must be set together".into(),
                ))
            }
        }

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.as_str());
        }

        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.endpoint.is_some())
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
        })
    }
}

#[async_trait]
impl BlobSink for S3BlobSink {
    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    async fn put_object(
        &self,
        key: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, ArchiveError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|err| ArchiveError::ObjectStore {
                key: key.to_string(),
                status: err.raw_response().map(|resp| resp.status().as_u16()),
                message: DisplayErrorContext(&err).to_string(),
            })?;

        Ok(StoredObject {
            key: key.to_string(),
            location: format!("s3://{}/{}", self.bucket, key),
            byte_size: bytes.len(),
            content_hash: sha256_hex(bytes),
        })
    }
}
