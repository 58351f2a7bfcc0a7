//! S3 object access with ETag-conditional writes
//!
//! Storage-backed leases rely on two S3 preconditions: `If-None-Match: *`
//! (create only if absent) and `If-Match: <etag>` (replace only the version
//! the caller last read). A failed precondition surfaces as
//! [`StorageError::PreconditionFailed`], never as a generic request error.

use anyhow::{anyhow, Context};
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::SdkError,
    primitives::ByteStream,
    Client,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub mod config;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Another writer changed or created the object first
    #[error("Precondition failed for s3://{bucket}/{key}")]
    PreconditionFailed { bucket: String, key: String },

    #[error("S3 request failed: {0:#}")]
    Request(anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Object body plus the ETag identifying this exact version
#[derive(Debug, Clone)]
pub struct VersionedObject {
    pub body: Vec<u8>,
    pub etag: String,
}

fn status_code<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub fn new(config: config::StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "feedline-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(bucket = %config.bucket, endpoint = ?config.endpoint, "Storage client initialized");

        Self::from_client(client, config.bucket)
    }

    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn conflict(&self, key: &str) -> StorageError {
        StorageError::PreconditionFailed {
            bucket: self.bucket.clone(),
            key: key.to_string(),
        }
    }

    /// Create the bucket unless it already exists
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn ensure_bucket(&self) -> StorageResult<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }

        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .context("Failed to create S3 bucket")
            .map_err(StorageError::Request)?;

        info!("Created bucket");
        Ok(())
    }

    /// Read an object with its ETag, or `None` when the key does not exist
    #[instrument(skip(self))]
    pub async fn get_versioned(&self, key: &str) -> StorageResult<Option<VersionedObject>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_no_such_key())
                    || status_code(&err) == Some(404) =>
            {
                debug!("Object not found");
                return Ok(None);
            },
            Err(err) => {
                return Err(StorageError::Request(
                    anyhow::Error::new(err).context(format!("Failed to read s3 object {}", key)),
                ))
            },
        };

        let etag = response
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Request(anyhow!("S3 returned no ETag for {}", key)))?;

        let body = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")
            .map_err(StorageError::Request)?
            .into_bytes()
            .to_vec();

        Ok(Some(VersionedObject { body, etag }))
    }

    /// Write only if no object exists under `key`; returns the new ETag
    #[instrument(skip(self, body))]
    pub async fn put_if_absent(&self, key: &str, body: Vec<u8>) -> StorageResult<String> {
        self.put_conditional(key, body, None).await
    }

    /// Replace the object only if its current ETag is `etag`; returns the new ETag
    #[instrument(skip(self, body))]
    pub async fn put_if_match(&self, key: &str, body: Vec<u8>, etag: &str) -> StorageResult<String> {
        self.put_conditional(key, body, Some(etag)).await
    }

    async fn put_conditional(
        &self,
        key: &str,
        body: Vec<u8>,
        etag: Option<&str>,
    ) -> StorageResult<String> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body));

        let request = match etag {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };

        match request.send().await {
            Ok(output) => output
                .e_tag()
                .map(str::to_string)
                .ok_or_else(|| StorageError::Request(anyhow!("S3 returned no ETag for {}", key))),
            // 412 for a failed precondition, 409 when a concurrent conditional write won
            Err(err) if matches!(status_code(&err), Some(412) | Some(409)) => {
                debug!(status = ?status_code(&err), "Conditional write rejected");
                Err(self.conflict(key))
            },
            Err(err) => Err(StorageError::Request(
                anyhow::Error::new(err).context(format!("Failed to write s3 object {}", key)),
            )),
        }
    }

    /// Unconditional overwrite; returns the new ETag
    #[instrument(skip(self, body))]
    pub async fn put(&self, key: &str, body: Vec<u8>) -> StorageResult<String> {
        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("Failed to write s3 object {}", key))
            .map_err(StorageError::Request)?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Request(anyhow!("S3 returned no ETag for {}", key)))
    }
}
