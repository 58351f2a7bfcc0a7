//! `feedline-worker migrate`

use anyhow::{Context, Result};
use feedline_core::config::Config;
use feedline_core::db;

use crate::services;

pub async fn run(config: &Config) -> Result<()> {
    let pool = services::connect(config).await?;
    db::run_migrations(&pool)
        .await
        .context("Failed to apply migrations")?;

    println!("Migrations applied.");
    Ok(())
}
