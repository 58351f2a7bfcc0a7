//! Configuration management

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::queue::WorkQueueConfig;
use crate::storage::config::StorageConfig;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/feedline";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default number of queued-mode workers.
pub const DEFAULT_WORKER_COUNT: usize = 32;

/// Default number of items a queued-mode producer may run ahead of the workers.
pub const DEFAULT_MAX_PENDING: usize = 10;

/// Default enumeration page size.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default singleton lease name.
pub const DEFAULT_SINGLETON_NAME: &str = "feedline-singleton";

/// Default singleton lease duration (1 hour).
pub const DEFAULT_SINGLETON_LEASE_SECS: u64 = 3600;

/// Default hand-off window when a cancelled worker lets its lease lapse.
pub const DEFAULT_RELEASE_IN_SECS: u64 = 60;

/// Default S3 key prefix for storage-backed leases.
pub const DEFAULT_LEASE_PREFIX: &str = "leases/";

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Which store backs the lease service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeaseBackend {
    #[default]
    Database,
    Storage,
}

impl FromStr for LeaseBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "database" | "db" | "postgres" => Ok(Self::Database),
            "storage" | "s3" | "blob" => Ok(Self::Storage),
            other => Err(anyhow::anyhow!("Invalid lease backend: {}", other)),
        }
    }
}

/// Collector, queue and singleton tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub max_pending: usize,
    pub batch_size: usize,
    pub lease_backend: LeaseBackend,
    pub lease_prefix: String,
    pub singleton_name: String,
    pub singleton_lease_secs: u64,
    /// Defaults to half the singleton lease duration
    pub renew_interval_secs: u64,
    pub release_in_secs: u64,
}

impl PipelineConfig {
    pub fn queue(&self) -> WorkQueueConfig {
        WorkQueueConfig {
            worker_count: self.worker_count,
            max_pending: self.max_pending,
        }
    }

    pub fn singleton_lease_duration(&self) -> Duration {
        Duration::from_secs(self.singleton_lease_secs)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs)
    }

    pub fn release_in(&self) -> Duration {
        Duration::from_secs(self.release_in_secs)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from `.env`, the environment, and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let singleton_lease_secs =
            env_or("FEEDLINE_SINGLETON_LEASE_SECS", DEFAULT_SINGLETON_LEASE_SECS);

        let lease_backend = match std::env::var("FEEDLINE_LEASE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => LeaseBackend::default(),
        };

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            storage: StorageConfig::from_env(),
            pipeline: PipelineConfig {
                worker_count: env_or("FEEDLINE_WORKER_COUNT", DEFAULT_WORKER_COUNT),
                max_pending: env_or("FEEDLINE_MAX_PENDING", DEFAULT_MAX_PENDING),
                batch_size: env_or("FEEDLINE_BATCH_SIZE", DEFAULT_BATCH_SIZE),
                lease_backend,
                lease_prefix: std::env::var("FEEDLINE_LEASE_PREFIX")
                    .unwrap_or_else(|_| DEFAULT_LEASE_PREFIX.to_string()),
                singleton_name: std::env::var("FEEDLINE_SINGLETON_NAME")
                    .unwrap_or_else(|_| DEFAULT_SINGLETON_NAME.to_string()),
                singleton_lease_secs,
                renew_interval_secs: env_or(
                    "FEEDLINE_RENEW_INTERVAL_SECS",
                    singleton_lease_secs / 2,
                ),
                release_in_secs: env_or("FEEDLINE_RELEASE_IN_SECS", DEFAULT_RELEASE_IN_SECS),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        let pipeline = &self.pipeline;
        if pipeline.worker_count == 0 {
            anyhow::bail!("FEEDLINE_WORKER_COUNT must be greater than 0");
        }
        if pipeline.max_pending == 0 {
            anyhow::bail!("FEEDLINE_MAX_PENDING must be greater than 0");
        }
        if pipeline.batch_size < 2 {
            anyhow::bail!(
                "FEEDLINE_BATCH_SIZE must be at least 2 to tell commits apart, got {}",
                pipeline.batch_size
            );
        }
        if pipeline.singleton_name.trim().is_empty() {
            anyhow::bail!("FEEDLINE_SINGLETON_NAME cannot be empty");
        }
        if pipeline.renew_interval_secs == 0
            || pipeline.renew_interval_secs >= pipeline.singleton_lease_secs
        {
            anyhow::bail!(
                "Renew interval ({}s) must be positive and shorter than the lease ({}s)",
                pipeline.renew_interval_secs,
                pipeline.singleton_lease_secs
            );
        }

        if pipeline.lease_backend == LeaseBackend::Storage && self.storage.bucket.is_empty() {
            anyhow::bail!("S3_BUCKET is required for storage-backed leases");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            storage: StorageConfig::default(),
            pipeline: PipelineConfig {
                worker_count: DEFAULT_WORKER_COUNT,
                max_pending: DEFAULT_MAX_PENDING,
                batch_size: DEFAULT_BATCH_SIZE,
                lease_backend: LeaseBackend::Database,
                lease_prefix: DEFAULT_LEASE_PREFIX.to_string(),
                singleton_name: DEFAULT_SINGLETON_NAME.to_string(),
                singleton_lease_secs: DEFAULT_SINGLETON_LEASE_SECS,
                renew_interval_secs: DEFAULT_SINGLETON_LEASE_SECS / 2,
                release_in_secs: DEFAULT_RELEASE_IN_SECS,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.queue().worker_count, 32);
        assert_eq!(config.pipeline.queue().max_pending, 10);
        assert_eq!(config.pipeline.renew_interval(), Duration::from_secs(1800));
    }

    #[test]
    fn test_validate_rejects_bad_pipeline_settings() {
        let mut config = Config::default();
        config.pipeline.batch_size = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.renew_interval_secs = config.pipeline.singleton_lease_secs;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.database.min_connections = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lease_backend_from_str() {
        assert_eq!("S3".parse::<LeaseBackend>().unwrap(), LeaseBackend::Storage);
        assert_eq!("postgres".parse::<LeaseBackend>().unwrap(), LeaseBackend::Database);
        assert!("redis".parse::<LeaseBackend>().is_err());
    }

    #[test]
    #[serial]
    fn test_load_reads_environment() {
        std::env::set_var("FEEDLINE_WORKER_COUNT", "4");
        std::env::set_var("FEEDLINE_SINGLETON_LEASE_SECS", "120");
        std::env::set_var("FEEDLINE_LEASE_BACKEND", "database");

        let config = Config::load().unwrap();
        assert_eq!(config.pipeline.worker_count, 4);
        assert_eq!(config.pipeline.singleton_lease_secs, 120);
        assert_eq!(config.pipeline.renew_interval_secs, 60);

        std::env::remove_var("FEEDLINE_WORKER_COUNT");
        std::env::remove_var("FEEDLINE_SINGLETON_LEASE_SECS");
        std::env::remove_var("FEEDLINE_LEASE_BACKEND");
    }
}
