//! Package registration summaries
//!
//! Downstream of the catalog ingester: every registration row the ingester
//! wrote under the `catalog-to-database` cursor is summarized into
//! `package_registration_summaries`. The upsert only overwrites a summary with
//! data from the same or a newer commit, so replaying a round is harmless.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedline_core::collector::{
    CollectorOptions, CommitCollector, CommitProcessor, ItemBatch, ProgressStore,
};
use feedline_core::commit::{BoundarySafeEnumerator, PgTableScanSource};
use feedline_core::cursor::CursorStore;
use feedline_core::PipelineResult;
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Written by the catalog ingester once registrations are durable
pub const CATALOG_CURSOR: &str = "catalog-to-database";

/// Owned by this stage
pub const SUMMARY_CURSOR: &str = "package-registration-summaries";

/// Rows handed to one `process_batch` call in sequential mode
pub const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PackageRegistration {
    pub lower_id: String,
    pub id: String,
    pub version_count: i32,
    pub listed_count: i32,
    pub latest_version: Option<String>,
    pub last_commit_timestamp: DateTime<Utc>,
}

pub type RegistrationCollector = CommitCollector<
    RegistrationSummaryProcessor,
    BoundarySafeEnumerator<PgTableScanSource<PackageRegistration>>,
>;

pub struct RegistrationSummaryProcessor {
    pool: PgPool,
    dependencies: Vec<String>,
    batch_size: usize,
    page_size: usize,
}

impl RegistrationSummaryProcessor {
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            dependencies: vec![CATALOG_CURSOR.to_string()],
            batch_size,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[async_trait]
impl CommitProcessor for RegistrationSummaryProcessor {
    type Entity = PackageRegistration;
    type Item = PackageRegistration;

    fn cursor_name(&self) -> &str {
        SUMMARY_CURSOR
    }

    fn dependency_cursor_names(&self) -> &[String] {
        &self.dependencies
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn entity_key(&self, entity: &PackageRegistration) -> String {
        entity.lower_id.clone()
    }

    async fn initialize_items(
        &self,
        entities: &[PackageRegistration],
        skip: usize,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<ItemBatch<PackageRegistration>> {
        let items: Vec<_> = entities
            .iter()
            .skip(skip)
            .take(self.page_size)
            .cloned()
            .collect();
        let has_more_items = skip + items.len() < entities.len();

        Ok(ItemBatch {
            items,
            has_more_items,
        })
    }

    async fn process_batch(
        &self,
        items: Vec<PackageRegistration>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let count = items.len();
        let mut lower_ids = Vec::with_capacity(count);
        let mut ids = Vec::with_capacity(count);
        let mut version_counts = Vec::with_capacity(count);
        let mut listed_counts = Vec::with_capacity(count);
        let mut latest_versions = Vec::with_capacity(count);
        let mut timestamps = Vec::with_capacity(count);

        for item in items {
            lower_ids.push(item.lower_id);
            ids.push(item.id);
            version_counts.push(item.version_count);
            listed_counts.push(item.listed_count);
            latest_versions.push(item.latest_version);
            timestamps.push(item.last_commit_timestamp);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO package_registration_summaries
                (lower_id, id, version_count, listed_count, latest_version,
                 last_commit_timestamp, summarized_at)
            SELECT r.lower_id, r.id, r.version_count, r.listed_count, r.latest_version,
                   r.last_commit_timestamp, NOW()
            FROM UNNEST($1::text[], $2::text[], $3::int[], $4::int[], $5::text[], $6::timestamptz[])
                AS r(lower_id, id, version_count, listed_count, latest_version, last_commit_timestamp)
            ON CONFLICT (lower_id) DO UPDATE
            SET id = EXCLUDED.id,
                version_count = EXCLUDED.version_count,
                listed_count = EXCLUDED.listed_count,
                latest_version = EXCLUDED.latest_version,
                last_commit_timestamp = EXCLUDED.last_commit_timestamp,
                summarized_at = NOW()
            WHERE package_registration_summaries.last_commit_timestamp
                <= EXCLUDED.last_commit_timestamp
            "#,
        )
        .bind(&lower_ids)
        .bind(&ids)
        .bind(&version_counts)
        .bind(&listed_counts)
        .bind(&latest_versions)
        .bind(&timestamps)
        .execute(&self.pool)
        .await?;

        debug!(
            registrations = count,
            written = result.rows_affected(),
            "Upserted package registration summaries"
        );

        Ok(())
    }
}

/// Collector over `catalog_package_registrations`, bounded by [`CATALOG_CURSOR`]
pub fn collector(
    pool: PgPool,
    cursors: Arc<dyn CursorStore>,
    progress: Arc<dyn ProgressStore>,
    batch_size: usize,
    options: CollectorOptions,
) -> PipelineResult<RegistrationCollector> {
    let source = PgTableScanSource::new(
        pool.clone(),
        "catalog_package_registrations",
        "last_commit_timestamp",
        "lower_id",
        |r: &PackageRegistration| r.last_commit_timestamp,
    )?;

    let processor = Arc::new(RegistrationSummaryProcessor::new(pool, batch_size));

    Ok(
        CommitCollector::new(processor, BoundarySafeEnumerator::new(source), cursors, progress)
            .with_options(options),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::postgres::PgPoolOptions;

    fn registrations(count: usize) -> Vec<PackageRegistration> {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|n| PackageRegistration {
                lower_id: format!("package.{}", n),
                id: format!("Package.{}", n),
                version_count: 1,
                listed_count: 1,
                latest_version: Some("1.0.0".to_string()),
                last_commit_timestamp: at,
            })
            .collect()
    }

    fn processor(page_size: usize) -> RegistrationSummaryProcessor {
        // Never connects; initialize_items does not touch the database.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgresql://localhost/feedline")
            .unwrap();
        RegistrationSummaryProcessor::new(pool, 1000).with_page_size(page_size)
    }

    #[tokio::test]
    async fn test_stage_depends_on_catalog_cursor() {
        let processor = processor(10);
        assert_eq!(processor.cursor_name(), SUMMARY_CURSOR);
        assert_eq!(processor.dependency_cursor_names(), [CATALOG_CURSOR.to_string()]);
    }

    #[tokio::test]
    async fn test_entities_are_keyed_by_lower_id() {
        let processor = processor(10);
        let entities = registrations(1);
        assert_eq!(processor.entity_key(&entities[0]), "package.0");
    }

    #[tokio::test]
    async fn test_initialize_items_pages_through_entities() {
        let processor = processor(2);
        let entities = registrations(5);
        let cancel = CancellationToken::new();

        let first = processor.initialize_items(&entities, 0, &cancel).await.unwrap();
        assert_eq!(first.items, entities[0..2]);
        assert!(first.has_more_items);

        let last = processor.initialize_items(&entities, 4, &cancel).await.unwrap();
        assert_eq!(last.items, entities[4..5]);
        assert!(!last.has_more_items);
    }

    #[tokio::test]
    async fn test_initialize_items_past_end_is_empty() {
        let processor = processor(2);
        let batch = processor
            .initialize_items(&registrations(3), 3, &CancellationToken::new())
            .await
            .unwrap();
        assert!(batch.items.is_empty());
        assert!(!batch.has_more_items);
    }
}
