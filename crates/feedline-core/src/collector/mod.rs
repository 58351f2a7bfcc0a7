//! Cursor-driven collection of one pipeline stage
//!
//! A run reads the stage's cursor as `start` and bounds the window with
//! `end`: the minimum of the dependency cursors, or the current time for a
//! stage without dependencies. It then repeats rounds until the enumerator
//! finds nothing new in `(start, end]`:
//!
//! 1. renew the singleton lease, when one is attached
//! 2. enumerate complete commits
//! 3. process them sequentially or through the work queue
//! 4. move the cursor to the newest processed commit
//!
//! Any failure aborts the run. Only rounds that finished moved the cursor, so
//! re-running the stage replays at most the failed round.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::commit::{Commit, CommitEnumerator};
use crate::cursor::CursorStore;
use crate::error::{PipelineError, PipelineResult};
use crate::queue::{WorkQueue, WorkQueueConfig, WorkQueueError};
use crate::singleton::SingletonCoordinator;

pub mod processor;
pub mod progress;

pub use processor::{CommitProcessor, ItemBatch, ProcessMode};
pub use progress::{
    round_fingerprint, Checkpoint, MemoryProgressStore, PgProgressStore, ProgressKey, ProgressStore,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorOptions {
    pub mode: ProcessMode,
    pub queue: WorkQueueConfig,
}

/// Totals for one collector run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectorReport {
    pub cursor_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Cursor value when the run finished
    pub cursor: DateTime<Utc>,
    pub rounds: usize,
    pub commits: usize,
    pub entities: usize,
    pub items: usize,
}

fn queue_error(err: WorkQueueError) -> PipelineError {
    match err {
        WorkQueueError::Cancelled => PipelineError::Cancelled,
        other => PipelineError::Queue(other),
    }
}

pub struct CommitCollector<P, C> {
    processor: Arc<P>,
    enumerator: C,
    cursors: Arc<dyn CursorStore>,
    progress: Arc<dyn ProgressStore>,
    singleton: Option<Arc<SingletonCoordinator>>,
    options: CollectorOptions,
}

impl<P, C> CommitCollector<P, C>
where
    P: CommitProcessor,
    C: CommitEnumerator<Entity = P::Entity>,
{
    pub fn new(
        processor: Arc<P>,
        enumerator: C,
        cursors: Arc<dyn CursorStore>,
        progress: Arc<dyn ProgressStore>,
    ) -> Self {
        Self {
            processor,
            enumerator,
            cursors,
            progress,
            singleton: None,
            options: CollectorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CollectorOptions) -> Self {
        self.options = options;
        self
    }

    /// Renew this singleton before every round; losing it aborts the run
    pub fn with_singleton(mut self, singleton: Arc<SingletonCoordinator>) -> Self {
        self.singleton = Some(singleton);
        self
    }

    /// Collect until caught up with `end`, or until `cancel` fires between rounds
    #[instrument(skip_all, fields(cursor = %self.processor.cursor_name()))]
    pub async fn run(&self, cancel: &CancellationToken) -> PipelineResult<CollectorReport> {
        let cursor_name = self.processor.cursor_name();
        let dependencies = self.processor.dependency_cursor_names();
        let batch_size = self.processor.batch_size();

        let mut start = self.cursors.get_value(cursor_name).await?;
        let end = if dependencies.is_empty() {
            Utc::now()
        } else {
            self.cursors.get_minimum(dependencies).await?
        };

        info!(
            %start,
            %end,
            dependencies = ?dependencies,
            mode = ?self.options.mode,
            "Starting commit collection"
        );

        let mut report = CollectorReport {
            cursor_name: cursor_name.to_string(),
            start,
            end,
            cursor: start,
            rounds: 0,
            commits: 0,
            entities: 0,
            items: 0,
        };

        loop {
            if cancel.is_cancelled() {
                info!(cursor = %start, "Collection cancelled between rounds");
                return Err(PipelineError::Cancelled);
            }

            if let Some(singleton) = &self.singleton {
                singleton.renew().await?;
            }

            let commits = self
                .enumerator
                .get_commits(start, end, batch_size, cancel)
                .await?;

            let (Some(first), Some(last)) = (commits.first(), commits.last()) else {
                info!("No more commits were found within the bounds");
                break;
            };
            let (min, max) = (first.timestamp, last.timestamp);
            let commit_count = commits.len();
            let entity_count: usize = commits.iter().map(Commit::len).sum();

            info!(
                commits = commit_count,
                entities = entity_count,
                min = %min,
                max = %max,
                "Fetched commits"
            );

            let items = match self.options.mode {
                ProcessMode::Sequential => {
                    let key = ProgressKey {
                        cursor_name: cursor_name.to_string(),
                        first_commit: min,
                        last_commit: max,
                    };
                    self.process_sequential(commits, &key, cancel).await?
                },
                ProcessMode::Queued => self.process_queued(commits, cancel).await?,
            };

            start = max;
            self.cursors.set_value(cursor_name, start).await?;
            info!(cursor = %start, items, "[CHECKPOINT] Cursor moved");

            report.cursor = start;
            report.rounds += 1;
            report.commits += commit_count;
            report.entities += entity_count;
            report.items += items;
        }

        info!(
            rounds = report.rounds,
            commits = report.commits,
            items = report.items,
            cursor = %report.cursor,
            "Commit collection caught up"
        );

        Ok(report)
    }

    async fn process_sequential(
        &self,
        commits: Vec<Commit<P::Entity>>,
        key: &ProgressKey,
        cancel: &CancellationToken,
    ) -> PipelineResult<usize> {
        let fingerprint = round_fingerprint(&commits, |entity| self.processor.entity_key(entity));
        let entities: Vec<P::Entity> = commits.into_iter().flat_map(|c| c.entities).collect();

        let mut skip = match self.progress.get(key).await? {
            Some(checkpoint) if checkpoint.fingerprint == fingerprint => {
                info!(skip = checkpoint.skip, "Resuming round from checkpoint");
                checkpoint.skip
            },
            Some(checkpoint) => {
                warn!(
                    skip = checkpoint.skip,
                    "Round entities changed since the checkpoint, starting over"
                );
                0
            },
            None => 0,
        };
        let mut processed = 0;

        loop {
            let batch = self
                .processor
                .initialize_items(&entities, skip, cancel)
                .await
                .map_err(PipelineError::Processor)?;
            let count = batch.items.len();

            if count > 0 {
                self.processor
                    .process_batch(batch.items, cancel)
                    .await
                    .map_err(PipelineError::Processor)?;
            }
            processed += count;

            if !batch.has_more_items {
                break;
            }
            if count == 0 {
                return Err(PipelineError::Processor(anyhow::anyhow!(
                    "processor reported more items after skip {} but returned none",
                    skip
                )));
            }

            skip += count;
            let checkpoint = Checkpoint {
                skip,
                fingerprint: fingerprint.clone(),
            };
            self.progress.set(key, &checkpoint).await?;
            debug!(skip, "Saved round progress");

            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
        }

        self.progress.clear(&key.cursor_name).await?;
        Ok(processed)
    }

    async fn process_queued(
        &self,
        commits: Vec<Commit<P::Entity>>,
        cancel: &CancellationToken,
    ) -> PipelineResult<usize> {
        let processor = Arc::clone(&self.processor);
        let handler_cancel = cancel.clone();
        let queue = WorkQueue::start(self.options.queue, cancel.clone(), move |item: P::Item| {
            let processor = Arc::clone(&processor);
            let cancel = handler_cancel.clone();
            async move { processor.process_batch(vec![item], &cancel).await }
        });

        let mut enqueued = 0;
        for commit in &commits {
            let mut skip = 0;
            loop {
                let batch = match self
                    .processor
                    .initialize_items(&commit.entities, skip, cancel)
                    .await
                {
                    Ok(batch) => batch,
                    Err(err) => {
                        queue.abort();
                        // The initialization error is the one worth reporting.
                        let _ = queue.complete().await;
                        return Err(PipelineError::Processor(err));
                    },
                };
                let count = batch.items.len();

                for item in batch.items {
                    if let Err(err) = queue.enqueue(item).await {
                        // A worker failure explains why enqueue stopped.
                        return Err(queue_error(queue.complete().await.err().unwrap_or(err)));
                    }
                }
                enqueued += count;

                if !batch.has_more_items {
                    break;
                }
                if count == 0 {
                    queue.abort();
                    let _ = queue.complete().await;
                    return Err(PipelineError::Processor(anyhow::anyhow!(
                        "processor reported more items after skip {} but returned none",
                        skip
                    )));
                }
                skip += count;
            }
        }

        queue.complete().await.map_err(queue_error)?;
        Ok(enqueued)
    }
}
