//! Vector-backed range source, used by tests and local replays

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::RangeSource;

pub struct MemoryRangeSource<E> {
    entities: RwLock<Vec<E>>,
    timestamp: fn(&E) -> DateTime<Utc>,
    fetches: AtomicUsize,
}

impl<E> MemoryRangeSource<E>
where
    E: Clone + Send + Sync + 'static,
{
    pub fn new(mut entities: Vec<E>, timestamp: fn(&E) -> DateTime<Utc>) -> Self {
        entities.sort_by_key(|e| timestamp(e));
        Self {
            entities: RwLock::new(entities),
            timestamp,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Append entities as if the feed published them later
    pub async fn publish(&self, entities: impl IntoIterator<Item = E>) {
        let mut stored = self.entities.write().await;
        stored.extend(entities);
        let timestamp = self.timestamp;
        stored.sort_by_key(|e| timestamp(e));
    }

    /// Number of pages served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<E> RangeSource for MemoryRangeSource<E>
where
    E: Clone + Send + Sync + 'static,
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
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let timestamp = self.timestamp;
        Ok(self
            .entities
            .read()
            .await
            .iter()
            .filter(|e| {
                let ts = timestamp(e);
                ts > start && ts <= end
            })
            .take(limit)
            .cloned()
            .collect())
    }
}
