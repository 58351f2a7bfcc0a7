//! Backends wired from configuration

use anyhow::{Context, Result};
use feedline_core::config::{Config, LeaseBackend};
use feedline_core::db;
use feedline_core::lease::{DatabaseLeaseService, LeaseService, StorageLeaseService};
use feedline_core::storage::Storage;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

pub async fn connect(config: &Config) -> Result<PgPool> {
    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to the database")?;
    db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    Ok(pool)
}

/// The lease service selected by `FEEDLINE_LEASE_BACKEND`
pub async fn lease_service(config: &Config, pool: &PgPool) -> Result<Arc<dyn LeaseService>> {
    match config.pipeline.lease_backend {
        LeaseBackend::Database => {
            info!("Using database lease backend");
            Ok(Arc::new(DatabaseLeaseService::new(pool.clone())))
        },
        LeaseBackend::Storage => {
            let storage = Storage::new(config.storage.clone());
            storage
                .ensure_bucket()
                .await
                .with_context(|| format!("Failed to prepare bucket {}", storage.bucket()))?;

            info!(
                bucket = %storage.bucket(),
                prefix = %config.pipeline.lease_prefix,
                "Using storage lease backend"
            );
            Ok(Arc::new(StorageLeaseService::new(
                storage,
                config.pipeline.lease_prefix.clone(),
            )))
        },
    }
}
