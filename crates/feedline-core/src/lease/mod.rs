//! Named, time-bounded mutual exclusion with optimistic concurrency
//!
//! Every mutation presents the token the caller last observed. A concurrent
//! writer changes the token, so a stale caller's write fails instead of
//! clobbering state. Expected outcomes are reported as [`LeaseOutcome`]
//! values; [`LeaseError`] is for I/O failures and for the throwing
//! convenience methods.
//!
//! Backends:
//! - [`DatabaseLeaseService`]: a `leases` row guarded by a version token
//! - [`StorageLeaseService`]: an S3 object guarded by its ETag
//! - [`MemoryLeaseService`]: a process-local map for tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageError;

pub mod database;
pub mod memory;
pub mod storage;

pub use database::DatabaseLeaseService;
pub use memory::MemoryLeaseService;
pub use storage::StorageLeaseService;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("The lease '{0}' was not acquired in the first place")]
    NotAcquiredAtAll(String),

    #[error("The lease '{0}' has been acquired by someone else")]
    AcquiredBySomeoneElse(String),

    #[error("The lease '{0}' is not available yet")]
    NotAvailable(String),

    #[error("Lease database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Lease storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Lease record '{name}' is unreadable: {source}")]
    Corrupt {
        name: String,
        source: serde_json::Error,
    },
}

pub type LeaseResult<T> = Result<T, LeaseError>;

/// Result of a non-throwing lease operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome<T> {
    Acquired(T),
    /// The handle was never acquired, or was already released
    NotAcquiredAtAll,
    /// Someone else changed the lease since this handle last saw it
    AcquiredBySomeoneElse,
    /// Held by an unexpired owner
    NotAvailable,
}

impl<T> LeaseOutcome<T> {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> LeaseOutcome<U> {
        match self {
            Self::Acquired(value) => LeaseOutcome::Acquired(f(value)),
            Self::NotAcquiredAtAll => LeaseOutcome::NotAcquiredAtAll,
            Self::AcquiredBySomeoneElse => LeaseOutcome::AcquiredBySomeoneElse,
            Self::NotAvailable => LeaseOutcome::NotAvailable,
        }
    }

    /// Turn the non-acquired outcomes into the matching [`LeaseError`]
    pub fn into_result(self, name: &str) -> LeaseResult<T> {
        match self {
            Self::Acquired(value) => Ok(value),
            Self::NotAcquiredAtAll => Err(LeaseError::NotAcquiredAtAll(name.to_string())),
            Self::AcquiredBySomeoneElse => {
                Err(LeaseError::AcquiredBySomeoneElse(name.to_string()))
            },
            Self::NotAvailable => Err(LeaseError::NotAvailable(name.to_string())),
        }
    }
}

/// Handle returned by a successful acquire
///
/// Renew and release update `end` and `token` in place. `end` is `None` once
/// the handle has been released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub end: Option<DateTime<Utc>>,
    pub token: String,
}

/// Stored state of a lease, as seen by [`LeaseService::get_or_null`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub name: String,
    pub end: Option<DateTime<Utc>>,
    pub token: String,
}

impl LeaseRecord {
    /// Held by someone at `now`
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.end.is_some_and(|end| end > now)
    }
}

#[async_trait]
pub trait LeaseService: Send + Sync {
    /// Take the lease if it is absent, expired, or released
    async fn try_acquire(&self, name: &str, duration: Duration)
        -> LeaseResult<LeaseOutcome<Lease>>;

    /// Move the end to `now + duration`, if the handle is still current
    async fn try_renew(&self, lease: &mut Lease, duration: Duration)
        -> LeaseResult<LeaseOutcome<()>>;

    /// Clear the end so the lease is immediately available
    async fn try_release(&self, lease: &mut Lease) -> LeaseResult<LeaseOutcome<()>>;

    /// Make the lease available regardless of holder; no-op when absent
    async fn break_lease(&self, name: &str) -> LeaseResult<()>;

    async fn get_or_null(&self, name: &str) -> LeaseResult<Option<LeaseRecord>>;

    async fn acquire(&self, name: &str, duration: Duration) -> LeaseResult<Lease> {
        self.try_acquire(name, duration).await?.into_result(name)
    }

    async fn renew(&self, lease: &mut Lease, duration: Duration) -> LeaseResult<()> {
        let name = lease.name.clone();
        self.try_renew(lease, duration).await?.into_result(&name)
    }

    async fn release(&self, lease: &mut Lease) -> LeaseResult<()> {
        let name = lease.name.clone();
        self.try_release(lease).await?.into_result(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_into_result() {
        assert_eq!(LeaseOutcome::Acquired(7).into_result("x").ok(), Some(7));
        assert!(matches!(
            LeaseOutcome::<()>::NotAvailable.into_result("x"),
            Err(LeaseError::NotAvailable(name)) if name == "x"
        ));
        assert!(matches!(
            LeaseOutcome::<()>::NotAcquiredAtAll.into_result("x"),
            Err(LeaseError::NotAcquiredAtAll(_))
        ));
        assert!(matches!(
            LeaseOutcome::<()>::AcquiredBySomeoneElse.into_result("x"),
            Err(LeaseError::AcquiredBySomeoneElse(_))
        ));
    }

    #[test]
    fn test_outcome_map_keeps_failure_variant() {
        assert_eq!(LeaseOutcome::Acquired(2).map(|v| v * 2), LeaseOutcome::Acquired(4));
        assert_eq!(
            LeaseOutcome::<i32>::AcquiredBySomeoneElse.map(|v| v * 2),
            LeaseOutcome::AcquiredBySomeoneElse
        );
    }
}
