//! Pipeline error taxonomy
//!
//! Expected lease outcomes are values ([`crate::lease::LeaseOutcome`]); the
//! variants here are for failures that abort a collector run. A failed run
//! leaves every cursor at the last fully processed commit.

use thiserror::Error;

use crate::commit::EnumerationError;
use crate::db::DbError;
use crate::lease::LeaseError;
use crate::queue::WorkQueueError;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Cursor or progress storage failed
    #[error(transparent)]
    Database(#[from] DbError),

    /// Pagination invariant violated; needs operator intervention
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Queue(#[from] WorkQueueError),

    /// The data source behind an enumerator failed
    #[error("Commit source failed: {0:#}")]
    Source(anyhow::Error),

    /// `initialize_items` or `process_batch` failed
    #[error("Processor failed: {0:#}")]
    Processor(anyhow::Error),

    #[error("Invalid pipeline configuration: {0}")]
    Config(String),

    #[error("Collection was cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether re-running the stage later can succeed without operator action
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Enumeration(_) | Self::Config(_))
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(DbError::Sqlx(err))
    }
}
