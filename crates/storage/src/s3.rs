//! S3 implementation of [`ObjectStore`].
//!
//! Works against any S3-compatible endpoint: the endpoint URL, static
//! credentials, and bucket come from the mount configuration rather than
//! the ambient AWS environment. Path-style addressing is forced so
//! bucket names never have to resolve through DNS.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::error::StorageError;
use crate::traits::{ObjectInfo, ObjectStat, ObjectStore};

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Endpoint URL, e.g. `https://play.min.io:9000`.
    pub endpoint: String,
    /// Bucket to mount.
    pub bucket: String,
    /// Signing region. S3-compatible servers accept any value here.
    pub region: String,
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// Optional session token.
    pub session_token: Option<String>,
    /// Skip TLS certificate verification. Honored by the transport
    /// layer; recorded here so the mount can surface it.
    pub insecure: bool,
}

impl S3Config {
    /// Connect timeout applied to the HTTP transport.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
}

/// [`ObjectStore`] backed by an S3-compatible endpoint.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client from connection settings.
    pub fn new(config: &S3Config) -> Self {
        let credentials: Credentials = Credentials::from_keys(
            config.access_key.clone(),
            config.secret_key.clone(),
            config.session_token.clone(),
        );

        if config.insecure {
            tracing::warn!("TLS certificate verification disabled for {}", config.endpoint);
        }

        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(S3Config::CONNECT_TIMEOUT)
                    .build(),
            )
            .build();

        Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket.clone(),
        }
    }

    /// Strip the quotes S3 wraps around ETag values.
    fn clean_etag(etag: Option<String>) -> String {
        etag.map(|e| e.trim_matches('"').to_string())
            .unwrap_or_default()
    }
}

/// Format an SDK error with its full context chain.
fn remote<E, R>(err: SdkError<E, R>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    StorageError::Remote(format!("{}", DisplayErrorContext(&err)))
}

/// True when a service error carries an S3 missing-key code.
fn is_missing_key_code<E: ProvideErrorMetadata>(err: &E) -> bool {
    matches!(err.code(), Some("NoSuchKey") | Some("NotFound") | Some("404"))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn bucket_exists(&self) -> Result<bool, StorageError> {
        match self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(service)) if service.err().is_not_found() => Ok(false),
            Err(err) => Err(remote(err)),
        }
    }

    async fn list_objects(
        &self,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix);
        if !recursive {
            request = request.delimiter("/");
        }

        let mut objects: Vec<ObjectInfo> = Vec::new();
        let mut pages = request.into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(remote)?;

            for common in page.common_prefixes() {
                if let Some(key) = common.prefix() {
                    objects.push(ObjectInfo {
                        key: key.to_string(),
                        size: 0,
                        last_modified: 0,
                        etag: String::new(),
                    });
                }
            }

            for object in page.contents() {
                let key: &str = object.key().unwrap_or_default();
                // The listed prefix can surface as its own zero-byte
                // marker object; the caller only wants children.
                if key.is_empty() || key == prefix {
                    continue;
                }
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0) as u64,
                    last_modified: object.last_modified().map(|t| t.secs()).unwrap_or(0),
                    etag: Self::clean_etag(object.e_tag().map(str::to_string)),
                });
            }
        }

        Ok(objects)
    }

    async fn stat_object(&self, key: &str) -> Result<ObjectStat, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => Ok(ObjectStat {
                size: head.content_length().unwrap_or(0) as u64,
                last_modified: head.last_modified().map(|t| t.secs()).unwrap_or(0),
                etag: Self::clean_etag(head.e_tag().map(str::to_string)),
                content_type: head.content_type().map(str::to_string),
            }),
            Err(SdkError::ServiceError(service)) if service.err().is_not_found() => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(remote(err)),
        }
    }

    async fn get_object(&self, key: &str, dest: &Path) -> Result<u64, StorageError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(SdkError::ServiceError(service)) if is_missing_key_code(service.err()) => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(err) => return Err(remote(err)),
        };

        let mut file: tokio::fs::File = tokio::fs::File::create(dest).await?;
        let mut body = response.body.into_async_read();
        let written: u64 = tokio::io::copy(&mut body, &mut file).await?;
        Ok(written)
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(remote)?;
        Ok(())
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        match self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src))
            .key(dst)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(service)) if is_missing_key_code(service.err()) => {
                Err(StorageError::NotFound(src.to_string()))
            }
            Err(err) => Err(remote(err)),
        }
    }

    async fn remove_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(remote)?;
        Ok(())
    }
}
