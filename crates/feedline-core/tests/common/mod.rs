//! Test containers for feedline-core integration tests
//!
//! Each test starts its own PostgreSQL (migrations applied) and, where the
//! storage lease backend is under test, a MinIO container with a fresh bucket.

#![allow(dead_code)]

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client as S3Client;
use feedline_core::storage::config::StorageConfig;
use feedline_core::storage::Storage;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

pub const DEFAULT_TEST_BUCKET: &str = "feedline-test-state";

pub const MINIO_ACCESS_KEY: &str = "minioadmin";
pub const MINIO_SECRET_KEY: &str = "minioadmin";

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    /// Start PostgreSQL and apply the bundled migrations
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        feedline_core::db::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

// ============================================================================
// MinIO Test Container
// ============================================================================

pub struct TestMinio {
    container: ContainerAsync<GenericImage>,
    client: S3Client,
    endpoint: String,
    bucket: String,
}

impl TestMinio {
    /// Start MinIO and create [`DEFAULT_TEST_BUCKET`]
    pub async fn start() -> Result<Self> {
        info!("Starting MinIO test container...");

        let container = GenericImage::new("minio/minio", "latest")
            .with_exposed_port(9000.tcp())
            .with_wait_for(WaitFor::message_on_stdout("MinIO Object Storage Server"))
            .with_env_var("MINIO_ROOT_USER", MINIO_ACCESS_KEY)
            .with_env_var("MINIO_ROOT_PASSWORD", MINIO_SECRET_KEY)
            .with_cmd(vec!["server", "/data"])
            .start()
            .await
            .context("Failed to start MinIO container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get MinIO host")?;
        let port = container
            .get_host_port_ipv4(9000.tcp())
            .await
            .context("Failed to get MinIO port")?;

        let endpoint = format!("http://{}:{}", host, port);
        debug!("MinIO endpoint: {}", endpoint);

        let s3_config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(&endpoint)
            .region(aws_config::Region::new("us-east-1"))
            .credentials_provider(aws_credential_types::Credentials::new(
                MINIO_ACCESS_KEY,
                MINIO_SECRET_KEY,
                None,
                None,
                "static",
            ))
            .load()
            .await;

        let client = S3Client::from_conf(
            aws_sdk_s3::config::Builder::from(&s3_config)
                .force_path_style(true)
                .build(),
        );

        client
            .create_bucket()
            .bucket(DEFAULT_TEST_BUCKET)
            .send()
            .await
            .context("Failed to create S3 bucket")?;

        Ok(Self {
            container,
            client,
            endpoint,
            bucket: DEFAULT_TEST_BUCKET.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// A [`Storage`] handle on the test bucket, configured the way the worker does
    pub fn storage(&self) -> Storage {
        Storage::new(StorageConfig::for_minio(&self.endpoint, &self.bucket))
    }

    /// A [`Storage`] handle sharing the raw test client
    pub fn storage_from_client(&self) -> Storage {
        Storage::from_client(self.client.clone(), &self.bucket)
    }
}

/// Route tracing output through the test harness
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,feedline_core=debug")),
        )
        .with_test_writer()
        .try_init();
}
