//! Feedline core
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Cursor-driven collection of an append-only, time-ordered change feed.
//!
//! # Architecture
//!
//! ```text
//! RangeSource ──> BoundarySafeEnumerator ──> CommitCollector ──> CommitProcessor
//!                                                │   │                 │
//!                                   CursorStore ─┘   └─ WorkQueue ─────┘
//!
//! LeaseService ──> SingletonCoordinator (renewed once per collector round)
//! ```
//!
//! - [`cursor`]: named monotonic watermarks
//! - [`commit`]: commits and the boundary-safe pagination that never splits one
//! - [`collector`]: drives one pipeline stage until it catches up
//! - [`queue`]: bounded worker pool used by the queued processing mode
//! - [`lease`]: optimistic-concurrency leases over PostgreSQL or S3
//! - [`singleton`]: one active worker per named responsibility
//!
//! A stage never reads past the minimum of the cursors it depends on, so a
//! downstream stage cannot observe data an upstream stage has not finished
//! committing.

pub mod collector;
pub mod commit;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod lease;
pub mod queue;
pub mod singleton;
pub mod storage;

pub use collector::{
    CollectorOptions, CollectorReport, CommitCollector, CommitProcessor, ItemBatch, ProcessMode,
};
pub use commit::{BoundarySafeEnumerator, Commit, CommitEnumerator, RangeSource};
pub use cursor::CursorStore;
pub use error::{PipelineError, PipelineResult};
pub use lease::{Lease, LeaseError, LeaseOutcome, LeaseService};
pub use queue::{WorkQueue, WorkQueueConfig};
pub use singleton::SingletonCoordinator;

/// Migrations for every table the PostgreSQL backends use
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
