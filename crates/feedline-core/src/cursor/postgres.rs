//! `cursors` table backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::debug;

use super::{min_timestamp, minimum_of, CursorStore};
use crate::db::DbResult;

#[derive(Clone)]
pub struct PgCursorStore {
    pool: PgPool,
}

impl PgCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn get_value(&self, name: &str) -> DbResult<DateTime<Utc>> {
        let value: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT value FROM cursors WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value.unwrap_or_else(min_timestamp))
    }

    async fn get_minimum(&self, names: &[String]) -> DbResult<DateTime<Utc>> {
        if names.is_empty() {
            return Ok(min_timestamp());
        }

        let rows: Vec<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT name, value FROM cursors WHERE name = ANY($1)")
                .bind(names)
                .fetch_all(&self.pool)
                .await?;
        let found: HashMap<String, DateTime<Utc>> = rows.into_iter().collect();

        Ok(minimum_of(names, |name| found.get(name).copied()))
    }

    async fn set_value(&self, name: &str, value: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cursors (name, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE
            SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;

        debug!(cursor = %name, %value, "Cursor updated");
        Ok(())
    }

    async fn set_values(&self, names: &[String], value: DateTime<Utc>) -> DbResult<()> {
        if names.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO cursors (name, value, updated_at)
            SELECT DISTINCT unnest($1::text[]), $2, NOW()
            ON CONFLICT (name) DO UPDATE
            SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(names)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ensure_exists(&self, name: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cursors (name, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(min_timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_all_names(&self) -> DbResult<Vec<String>> {
        let names = sqlx::query_scalar("SELECT name FROM cursors ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }
}
