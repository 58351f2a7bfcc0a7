//! In-process cursor store for tests and single-shot tooling

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{min_timestamp, minimum_of, CursorStore};
use crate::db::DbResult;

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    values: RwLock<BTreeMap<String, DateTime<Utc>>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = (S, DateTime<Utc>)>,
        S: Into<String>,
    {
        Self {
            values: RwLock::new(values.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get_value(&self, name: &str) -> DbResult<DateTime<Utc>> {
        Ok(self
            .values
            .read()
            .await
            .get(name)
            .copied()
            .unwrap_or_else(min_timestamp))
    }

    async fn get_minimum(&self, names: &[String]) -> DbResult<DateTime<Utc>> {
        let values = self.values.read().await;
        Ok(minimum_of(names, |name| values.get(name).copied()))
    }

    async fn set_value(&self, name: &str, value: DateTime<Utc>) -> DbResult<()> {
        self.values.write().await.insert(name.to_string(), value);
        Ok(())
    }

    async fn set_values(&self, names: &[String], value: DateTime<Utc>) -> DbResult<()> {
        let mut values = self.values.write().await;
        for name in names {
            values.insert(name.clone(), value);
        }
        Ok(())
    }

    async fn ensure_exists(&self, name: &str) -> DbResult<()> {
        self.values
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(min_timestamp);
        Ok(())
    }

    async fn get_all_names(&self) -> DbResult<Vec<String>> {
        Ok(self.values.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_missing_cursor_reads_as_minimum() {
        let store = MemoryCursorStore::new();
        assert_eq!(store.get_value("catalog").await.unwrap(), min_timestamp());
        assert!(store.get_all_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_minimum_picks_smallest() {
        let store = MemoryCursorStore::with_values([("a", ts(100)), ("b", ts(50))]);
        assert_eq!(store.get_minimum(&names(&["a", "b"])).await.unwrap(), ts(50));
        assert_eq!(store.get_minimum(&names(&["a", "a"])).await.unwrap(), ts(100));
    }

    #[tokio::test]
    async fn test_get_minimum_with_missing_name_blocks() {
        let store = MemoryCursorStore::with_values([("a", ts(100))]);
        assert_eq!(
            store.get_minimum(&names(&["a", "never-started"])).await.unwrap(),
            min_timestamp()
        );
        assert_eq!(store.get_minimum(&[]).await.unwrap(), min_timestamp());
    }

    #[tokio::test]
    async fn test_ensure_exists_keeps_existing_value() {
        let store = MemoryCursorStore::with_values([("a", ts(10))]);
        store.ensure_exists("a").await.unwrap();
        store.ensure_exists("b").await.unwrap();
        assert_eq!(store.get_value("a").await.unwrap(), ts(10));
        assert_eq!(store.get_all_names().await.unwrap(), names(&["a", "b"]));
    }

    #[tokio::test]
    async fn test_set_values_and_reset() {
        let store = MemoryCursorStore::new();
        store.set_values(&names(&["x", "y"]), ts(42)).await.unwrap();
        assert_eq!(store.get_value("y").await.unwrap(), ts(42));

        store.reset_value("x").await.unwrap();
        assert_eq!(store.get_value("x").await.unwrap(), min_timestamp());
        assert_eq!(store.get_value("y").await.unwrap(), ts(42));
    }
}
