//! Pipeline stage plugin interface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// Items produced from a slice of entities, possibly one page at a time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemBatch<I> {
    pub items: Vec<I>,
    /// More items follow when called again with `skip + items.len()`
    pub has_more_items: bool,
}

impl<I> ItemBatch<I> {
    /// Every item in one batch
    pub fn complete(items: Vec<I>) -> Self {
        Self {
            items,
            has_more_items: false,
        }
    }
}

/// One stage of the pipeline
///
/// A stage owns the cursor named by [`cursor_name`](Self::cursor_name) and
/// never reads past the minimum of its dependency cursors. `process_batch`
/// must be idempotent: after a crash the same commits are processed again.
#[async_trait]
pub trait CommitProcessor: Send + Sync + 'static {
    type Entity: Send + Sync + 'static;
    type Item: Send + 'static;

    fn cursor_name(&self) -> &str;

    /// Upstream cursors bounding this stage; empty means "up to now"
    fn dependency_cursor_names(&self) -> &[String];

    /// Enumeration page size
    fn batch_size(&self) -> usize;

    /// Stable identity of an entity, used to recognise a round on resume
    fn entity_key(&self, entity: &Self::Entity) -> String;

    /// Turn entities into work items, starting after the first `skip` items
    async fn initialize_items(
        &self,
        entities: &[Self::Entity],
        skip: usize,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ItemBatch<Self::Item>>;

    async fn process_batch(
        &self,
        items: Vec<Self::Item>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// How a round's items are processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessMode {
    /// All entities of the round at once, in commit order
    #[default]
    Sequential,
    /// Per commit, items spread over the bounded work queue; unordered
    Queued,
}

impl FromStr for ProcessMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "queued" | "parallel" => Ok(Self::Queued),
            other => Err(anyhow::anyhow!("Invalid process mode: {}", other)),
        }
    }
}
