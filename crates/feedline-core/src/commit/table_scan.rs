//! PostgreSQL table scan over an indexed commit timestamp column

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool};
use std::marker::PhantomData;

use super::RangeSource;
use crate::error::{PipelineError, PipelineResult};

/// Pages rows of `table` ordered by `(timestamp_column, key_column)`
pub struct PgTableScanSource<E> {
    pool: PgPool,
    table: String,
    query: String,
    timestamp: fn(&E) -> DateTime<Utc>,
    _entity: PhantomData<fn() -> E>,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl<E> PgTableScanSource<E>
where
    E: for<'r> FromRow<'r, PgRow> + Send + Sync + Unpin + 'static,
{
    pub fn new(
        pool: PgPool,
        table: &str,
        timestamp_column: &str,
        key_column: &str,
        timestamp: fn(&E) -> DateTime<Utc>,
    ) -> PipelineResult<Self> {
        for name in [table, timestamp_column, key_column] {
            if !is_identifier(name) {
                return Err(PipelineError::config(format!(
                    "'{}' is not a plain lowercase SQL identifier",
                    name
                )));
            }
        }

        let query = format!(
            "SELECT * FROM {table} \
             WHERE {ts} > $1 AND {ts} <= $2 \
             ORDER BY {ts} ASC, {key} ASC \
             LIMIT $3",
            table = table,
            ts = timestamp_column,
            key = key_column,
        );

        Ok(Self {
            pool,
            table: table.to_string(),
            query,
            timestamp,
            _entity: PhantomData,
        })
    }
}

#[async_trait]
impl<E> RangeSource for PgTableScanSource<E>
where
    E: for<'r> FromRow<'r, PgRow> + Send + Sync + Unpin + 'static,
{
    type Entity = E;

    fn commit_timestamp(&self, entity: &E) -> DateTime<Utc> {
        (self.timestamp)(entity)
    }

    async fn fetch_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<E>> {
        let rows = sqlx::query_as::<_, E>(&self.query)
            .bind(start)
            .bind(end)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to scan {} between {} and {}", self.table, start, end))?;

        Ok(rows)
    }
}
