//! Boundary-safe pagination
//!
//! Each page is fetched in `(start, end]`, grouped by exact timestamp, and
//! only groups known to be complete are returned:
//!
//! - a short page reached `end`, so every group is complete and the next page
//!   starts at `end`
//! - a full page may have cut its newest group short, so that group is dropped
//!   and the next page starts at the newest group that was kept
//! - a full page holding one timestamp cannot be split safely and fails with
//!   [`EnumerationError::SingleTimestampPage`]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Commit, CommitEnumerator, EnumerationError, RangeSource};
use crate::error::{PipelineError, PipelineResult};

pub struct BoundarySafeEnumerator<S> {
    source: S,
    min_records: usize,
}

impl<S: RangeSource> BoundarySafeEnumerator<S> {
    /// Returns after the first page that yields at least one entity
    pub fn new(source: S) -> Self {
        Self {
            source,
            min_records: 1,
        }
    }

    /// Keep paging until at least `min_records` entities were accepted, the
    /// window is exhausted, or a page comes back empty
    pub fn with_min_records(mut self, min_records: usize) -> Self {
        self.min_records = min_records.max(1);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn group(&self, page: Vec<S::Entity>) -> Vec<Commit<S::Entity>> {
        let mut groups: BTreeMap<DateTime<Utc>, Vec<S::Entity>> = BTreeMap::new();
        for entity in page {
            groups
                .entry(self.source.commit_timestamp(&entity))
                .or_default()
                .push(entity);
        }
        groups
            .into_iter()
            .map(|(timestamp, entities)| Commit::new(timestamp, entities))
            .collect()
    }
}

#[async_trait]
impl<S: RangeSource> CommitEnumerator for BoundarySafeEnumerator<S> {
    type Entity = S::Entity;

    async fn get_commits(
        &self,
        mut start: DateTime<Utc>,
        end: DateTime<Utc>,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<Commit<S::Entity>>> {
        if batch_size == 0 {
            return Err(EnumerationError::ZeroBatchSize.into());
        }

        let mut commits = Vec::new();
        let mut accepted = 0usize;

        while start < end {
            let mut page = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                page = self.source.fetch_page(start, end, batch_size) => {
                    page.map_err(PipelineError::Source)?
                }
            };

            if page.is_empty() {
                break;
            }

            if page.len() > batch_size {
                warn!(
                    fetched = page.len(),
                    batch_size, "Source returned more entities than requested; truncating"
                );
                page.truncate(batch_size);
            }

            let fetched = page.len();
            let mut groups = self.group(page);

            if fetched == batch_size {
                if let [only] = groups.as_slice() {
                    return Err(EnumerationError::SingleTimestampPage {
                        timestamp: only.timestamp,
                        batch_size,
                    }
                    .into());
                }

                // The newest group may continue on the next page.
                groups.pop();
                if let Some(last) = groups.last() {
                    start = last.timestamp;
                }
            } else {
                start = end;
            }

            debug!(
                fetched,
                commits = groups.len(),
                next_start = %start,
                "Accepted page"
            );

            accepted += groups.iter().map(Commit::len).sum::<usize>();
            commits.extend(groups);

            if accepted >= self.min_records {
                break;
            }
        }

        Ok(commits)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::commit::MemoryRangeSource;
    use crate::cursor::min_timestamp;
    use chrono::TimeZone;
    use proptest::prelude::*;

    type Entity = (DateTime<Utc>, u32);

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    /// `(timestamp seconds, count)` groups into a sorted entity list
    fn entities(groups: &[(i64, usize)]) -> Vec<Entity> {
        let mut id = 0;
        let mut out = Vec::new();
        for &(secs, count) in groups {
            for _ in 0..count {
                out.push((ts(secs), id));
                id += 1;
            }
        }
        out
    }

    fn enumerator(groups: &[(i64, usize)]) -> BoundarySafeEnumerator<MemoryRangeSource<Entity>> {
        BoundarySafeEnumerator::new(MemoryRangeSource::new(entities(groups), |e: &Entity| e.0))
    }

    fn shape(commits: &[Commit<Entity>]) -> Vec<(i64, usize)> {
        commits
            .iter()
            .map(|c| (c.timestamp.timestamp(), c.len()))
            .collect()
    }

    #[tokio::test]
    async fn test_full_page_drops_newest_group() {
        let enumerator = enumerator(&[(10, 3), (20, 1), (30, 3)]);
        let cancel = CancellationToken::new();

        let commits = enumerator
            .get_commits(min_timestamp(), ts(30), 4, &cancel)
            .await
            .unwrap();
        assert_eq!(shape(&commits), vec![(10, 3)]);

        let commits = enumerator
            .get_commits(ts(10), ts(30), 4, &cancel)
            .await
            .unwrap();
        assert_eq!(shape(&commits), vec![(20, 1)]);

        let commits = enumerator
            .get_commits(ts(20), ts(30), 4, &cancel)
            .await
            .unwrap();
        assert_eq!(shape(&commits), vec![(30, 3)]);

        let commits = enumerator
            .get_commits(ts(30), ts(30), 4, &cancel)
            .await
            .unwrap();
        assert!(commits.is_empty());
    }

    #[tokio::test]
    async fn test_single_timestamp_full_page_is_fatal() {
        let enumerator = enumerator(&[(10, 3), (20, 1), (30, 4)]);
        let cancel = CancellationToken::new();

        let err = enumerator
            .get_commits(ts(20), ts(40), 4, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Enumeration(EnumerationError::SingleTimestampPage { batch_size: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_commit_exactly_filling_page_is_fatal_not_split() {
        // Five entities at t=10 with a page of four must never yield a partial commit.
        let enumerator = enumerator(&[(10, 5), (20, 1)]);
        let cancel = CancellationToken::new();

        let result = enumerator
            .get_commits(min_timestamp(), ts(20), 4, &cancel)
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::Enumeration(EnumerationError::SingleTimestampPage { .. }))
        ));
    }

    #[tokio::test]
    async fn test_short_page_accepts_everything_up_to_end() {
        let enumerator = enumerator(&[(10, 1), (20, 2), (30, 1), (40, 1)]);
        let cancel = CancellationToken::new();

        let commits = enumerator
            .get_commits(min_timestamp(), ts(30), 10, &cancel)
            .await
            .unwrap();
        assert_eq!(shape(&commits), vec![(10, 1), (20, 2), (30, 1)]);
        assert_eq!(enumerator.source().fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_min_records_keeps_paging() {
        let enumerator = enumerator(&[(10, 2), (20, 2), (30, 2), (40, 1)]).with_min_records(5);
        let cancel = CancellationToken::new();

        let commits = enumerator
            .get_commits(min_timestamp(), ts(40), 3, &cancel)
            .await
            .unwrap();
        assert_eq!(shape(&commits), vec![(10, 2), (20, 2), (30, 2)]);
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_rejected() {
        let enumerator = enumerator(&[(10, 1)]);
        let result = enumerator
            .get_commits(min_timestamp(), ts(10), 0, &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::Enumeration(EnumerationError::ZeroBatchSize))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let enumerator = enumerator(&[(10, 1)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = enumerator
            .get_commits(min_timestamp(), ts(10), 5, &cancel)
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(enumerator.source().fetch_count(), 0);
    }

    struct BrokenSource;

    #[async_trait]
    impl RangeSource for BrokenSource {
        type Entity = Entity;

        fn commit_timestamp(&self, entity: &Entity) -> DateTime<Utc> {
            entity.0
        }

        async fn fetch_page(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _limit: usize,
        ) -> anyhow::Result<Vec<Entity>> {
            anyhow::bail!("catalog page returned HTTP 503")
        }
    }

    #[tokio::test]
    async fn test_source_errors_propagate() {
        let enumerator = BoundarySafeEnumerator::new(BrokenSource);
        let err = enumerator
            .get_commits(min_timestamp(), ts(10), 5, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Source(_)));
        assert!(err.to_string().contains("HTTP 503"));
    }

    proptest! {
        #[test]
        fn test_commits_are_never_split(
            batch_size in 2usize..8,
            sizes in proptest::collection::vec(1usize..8, 0..25),
        ) {
            // Keep every commit strictly smaller than a page.
            let groups: Vec<(i64, usize)> = sizes
                .iter()
                .enumerate()
                .map(|(i, size)| ((i as i64 + 1) * 10, (*size).min(batch_size - 1)))
                .collect();
            let end = ts(groups.len() as i64 * 10 + 5);

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let collected = runtime.block_on(async {
                let enumerator = enumerator(&groups);
                let cancel = CancellationToken::new();
                let mut start = min_timestamp();
                let mut collected = Vec::new();
                loop {
                    let commits = enumerator
                        .get_commits(start, end, batch_size, &cancel)
                        .await
                        .unwrap();
                    let Some(last) = commits.last() else { break };
                    assert!(last.timestamp > start);
                    start = last.timestamp;
                    collected.extend(commits);
                }
                collected
            });

            prop_assert_eq!(shape(&collected), groups);
        }
    }
}
