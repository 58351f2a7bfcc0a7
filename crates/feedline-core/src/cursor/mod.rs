//! Named monotonic watermarks
//!
//! A cursor records how far a pipeline stage has durably progressed. Missing
//! cursors read as [`min_timestamp`], and [`CursorStore::get_minimum`] treats
//! any missing name as "not started", which blocks every stage downstream of
//! it until that cursor is written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use feedline_common::time::min_timestamp;

use crate::db::DbResult;

pub mod memory;
pub mod postgres;

pub use memory::MemoryCursorStore;
pub use postgres::PgCursorStore;

#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Stored value, or the minimum timestamp when the cursor does not exist
    async fn get_value(&self, name: &str) -> DbResult<DateTime<Utc>>;

    /// Smallest value among `names`; the minimum timestamp if any is missing
    async fn get_minimum(&self, names: &[String]) -> DbResult<DateTime<Utc>>;

    async fn set_value(&self, name: &str, value: DateTime<Utc>) -> DbResult<()>;

    /// Upsert the same value into several cursors at once
    async fn set_values(&self, names: &[String], value: DateTime<Utc>) -> DbResult<()>;

    /// Create the cursor at the minimum timestamp unless it exists
    async fn ensure_exists(&self, name: &str) -> DbResult<()>;

    /// Names of all stored cursors, sorted
    async fn get_all_names(&self) -> DbResult<Vec<String>>;

    /// Put the cursor back to the minimum timestamp
    async fn reset_value(&self, name: &str) -> DbResult<()> {
        self.set_value(name, min_timestamp()).await
    }
}

/// Shared reduction used by every backend's `get_minimum`
pub(crate) fn minimum_of(
    names: &[String],
    mut lookup: impl FnMut(&str) -> Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let mut minimum: Option<DateTime<Utc>> = None;
    for name in names {
        match lookup(name) {
            None => return min_timestamp(),
            Some(value) => minimum = Some(minimum.map_or(value, |m| m.min(value))),
        }
    }
    minimum.unwrap_or_else(min_timestamp)
}
