//! Commits and commit enumeration
//!
//! A commit is every entity the feed published at one exact timestamp. It is
//! the unit of progress: a cursor may only move to a commit's timestamp after
//! all of that commit's entities were processed, so enumerators must never
//! hand out part of a commit.
//!
//! Data sources only need to implement [`RangeSource`], a single ordered page
//! fetch. [`BoundarySafeEnumerator`] turns any range source into a
//! [`CommitEnumerator`] that respects commit boundaries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineResult;

pub mod enumerator;
pub mod memory;
pub mod table_scan;

pub use enumerator::BoundarySafeEnumerator;
pub use memory::MemoryRangeSource;
pub use table_scan::PgTableScanSource;

/// Entities sharing one source timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit<E> {
    pub timestamp: DateTime<Utc>,
    pub entities: Vec<E>,
}

impl<E> Commit<E> {
    pub fn new(timestamp: DateTime<Utc>, entities: Vec<E>) -> Self {
        Self {
            timestamp,
            entities,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnumerationError {
    /// A full page held a single timestamp, so the commit may continue past it
    #[error(
        "A full page of {batch_size} entities shares the single timestamp {timestamp}; \
         the batch size is too small for this commit"
    )]
    SingleTimestampPage {
        timestamp: DateTime<Utc>,
        batch_size: usize,
    },

    #[error("Batch size must be greater than zero")]
    ZeroBatchSize,
}

/// Produces complete commits in `(start, end]`, oldest first
#[async_trait]
pub trait CommitEnumerator: Send + Sync {
    type Entity: Send + Sync + 'static;

    async fn get_commits(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<Commit<Self::Entity>>>;
}

/// One ordered page of raw entities from a data source
#[async_trait]
pub trait RangeSource: Send + Sync {
    type Entity: Send + Sync + 'static;

    /// Timestamp of the commit the entity belongs to
    fn commit_timestamp(&self, entity: &Self::Entity) -> DateTime<Utc>;

    /// Up to `limit` entities with a commit timestamp in `(start, end]`,
    /// ascending by timestamp and then by a stable secondary key
    async fn fetch_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Self::Entity>>;
}
