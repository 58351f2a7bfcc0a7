//! Checkpoints inside a sequential round
//!
//! When a processor pages its items, the collector records how many items of
//! the current round were already processed. The key is the round's window
//! (first and last commit timestamp). Entities can move between commits while
//! a run is down, so every checkpoint also carries a fingerprint of the
//! round's entities; a restarted run only resumes from a checkpoint whose
//! fingerprint matches the round it enumerated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::commit::Commit;
use crate::db::{DbError, DbResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgressKey {
    pub cursor_name: String,
    pub first_commit: DateTime<Utc>,
    pub last_commit: DateTime<Utc>,
}

/// Items already processed for one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub skip: usize,
    /// See [`round_fingerprint`]
    pub fingerprint: String,
}

/// Identify the entities of a round, in order
///
/// Covers the entity count, each commit timestamp and each entity key, so a
/// checkpoint no longer matches once an entity joined, left or moved.
pub fn round_fingerprint<E>(commits: &[Commit<E>], key: impl Fn(&E) -> String) -> String {
    let mut hasher = Sha256::new();
    let mut count: u64 = 0;

    for commit in commits {
        let timestamp = commit.timestamp.timestamp_micros().to_be_bytes();
        for entity in &commit.entities {
            let key = key(entity);
            hasher.update(timestamp);
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(key.as_bytes());
            count += 1;
        }
    }
    hasher.update(count.to_be_bytes());

    format!("{}:{}", count, hex::encode(hasher.finalize()))
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(&self, key: &ProgressKey) -> DbResult<Option<Checkpoint>>;

    async fn set(&self, key: &ProgressKey, checkpoint: &Checkpoint) -> DbResult<()>;

    /// Forget every checkpoint of the cursor once a round completes
    async fn clear(&self, cursor_name: &str) -> DbResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    entries: Mutex<HashMap<ProgressKey, Checkpoint>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn get(&self, key: &ProgressKey) -> DbResult<Option<Checkpoint>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &ProgressKey, checkpoint: &Checkpoint) -> DbResult<()> {
        self.entries
            .lock()
            .await
            .insert(key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn clear(&self, cursor_name: &str) -> DbResult<()> {
        self.entries
            .lock()
            .await
            .retain(|key, _| key.cursor_name != cursor_name);
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgProgressStore {
    pool: PgPool,
}

impl PgProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressStore for PgProgressStore {
    async fn get(&self, key: &ProgressKey) -> DbResult<Option<Checkpoint>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT skip, fingerprint FROM collector_progress
            WHERE cursor_name = $1 AND first_commit = $2 AND last_commit = $3
            "#,
        )
        .bind(&key.cursor_name)
        .bind(key.first_commit)
        .bind(key.last_commit)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some((skip, fingerprint)) => {
                let skip = usize::try_from(skip).map_err(|_| {
                    DbError::invalid(&key.cursor_name, format!("negative skip {}", skip))
                })?;
                Ok(Some(Checkpoint { skip, fingerprint }))
            },
        }
    }

    async fn set(&self, key: &ProgressKey, checkpoint: &Checkpoint) -> DbResult<()> {
        let skip = i64::try_from(checkpoint.skip).map_err(|_| {
            DbError::invalid(&key.cursor_name, format!("skip {} overflows", checkpoint.skip))
        })?;

        sqlx::query(
            r#"
            INSERT INTO collector_progress
                (cursor_name, first_commit, last_commit, skip, fingerprint, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (cursor_name, first_commit, last_commit) DO UPDATE
            SET skip = EXCLUDED.skip,
                fingerprint = EXCLUDED.fingerprint,
                updated_at = NOW()
            "#,
        )
        .bind(&key.cursor_name)
        .bind(key.first_commit)
        .bind(key.last_commit)
        .bind(skip)
        .bind(&checkpoint.fingerprint)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear(&self, cursor_name: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM collector_progress WHERE cursor_name = $1")
            .bind(cursor_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
