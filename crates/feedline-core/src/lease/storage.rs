//! S3 object backend
//!
//! One JSON object per lease under a key prefix. The object's ETag is the
//! concurrency token: creation uses `If-None-Match: *` and every later write
//! uses `If-Match` with the ETag the caller last saw. Each body carries a fresh
//! revision id so that two writes never produce the same ETag.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedline_common::time::add_duration;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{Lease, LeaseError, LeaseOutcome, LeaseRecord, LeaseResult, LeaseService};
use crate::storage::{Storage, StorageError, VersionedObject};

#[derive(Debug, Serialize, Deserialize)]
struct LeaseDocument {
    name: String,
    end: Option<DateTime<Utc>>,
    revision: Uuid,
}

impl LeaseDocument {
    fn new(name: &str, end: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.to_string(),
            end,
            revision: Uuid::new_v4(),
        }
    }

    fn to_bytes(&self) -> LeaseResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| LeaseError::Corrupt {
            name: self.name.clone(),
            source,
        })
    }
}

#[derive(Clone)]
pub struct StorageLeaseService {
    storage: Storage,
    prefix: String,
}

impl StorageLeaseService {
    pub fn new(storage: Storage, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}.json", self.prefix, name)
    }

    async fn read(&self, name: &str) -> LeaseResult<Option<(LeaseDocument, String)>> {
        let Some(VersionedObject { body, etag }) = self.storage.get_versioned(&self.key(name)).await?
        else {
            return Ok(None);
        };

        let document = serde_json::from_slice(&body).map_err(|source| LeaseError::Corrupt {
            name: name.to_string(),
            source,
        })?;

        Ok(Some((document, etag)))
    }

    /// Conditional replace; `Ok(None)` when the ETag no longer matches
    async fn replace(
        &self,
        name: &str,
        etag: &str,
        end: Option<DateTime<Utc>>,
    ) -> LeaseResult<Option<String>> {
        let body = LeaseDocument::new(name, end).to_bytes()?;
        match self.storage.put_if_match(&self.key(name), body, etag).await {
            Ok(etag) => Ok(Some(etag)),
            Err(StorageError::PreconditionFailed { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl LeaseService for StorageLeaseService {
    #[instrument(skip(self))]
    async fn try_acquire(
        &self,
        name: &str,
        duration: Duration,
    ) -> LeaseResult<LeaseOutcome<Lease>> {
        let now = Utc::now();
        let end = add_duration(now, duration);

        let token = match self.read(name).await? {
            None => {
                let body = LeaseDocument::new(name, Some(end)).to_bytes()?;
                match self.storage.put_if_absent(&self.key(name), body).await {
                    Ok(etag) => etag,
                    Err(StorageError::PreconditionFailed { .. }) => {
                        debug!("Lost the race to create the lease");
                        return Ok(LeaseOutcome::NotAvailable);
                    },
                    Err(err) => return Err(err.into()),
                }
            },
            Some((document, _)) if document.end.is_some_and(|e| e > now) => {
                return Ok(LeaseOutcome::NotAvailable);
            },
            Some((_, etag)) => match self.replace(name, &etag, Some(end)).await? {
                Some(etag) => etag,
                None => {
                    debug!("Lost the race to take over the lease");
                    return Ok(LeaseOutcome::NotAvailable);
                },
            },
        };

        info!(lease = %name, %end, "Lease acquired");

        Ok(LeaseOutcome::Acquired(Lease {
            name: name.to_string(),
            end: Some(end),
            token,
        }))
    }

    #[instrument(skip(self, lease), fields(lease = %lease.name))]
    async fn try_renew(
        &self,
        lease: &mut Lease,
        duration: Duration,
    ) -> LeaseResult<LeaseOutcome<()>> {
        if lease.end.is_none() {
            return Ok(LeaseOutcome::NotAcquiredAtAll);
        }

        let end = add_duration(Utc::now(), duration);
        match self.replace(&lease.name, &lease.token, Some(end)).await? {
            Some(etag) => {
                lease.end = Some(end);
                lease.token = etag;
                debug!(%end, "Lease renewed");
                Ok(LeaseOutcome::Acquired(()))
            },
            None => Ok(LeaseOutcome::AcquiredBySomeoneElse),
        }
    }

    #[instrument(skip(self, lease), fields(lease = %lease.name))]
    async fn try_release(&self, lease: &mut Lease) -> LeaseResult<LeaseOutcome<()>> {
        if lease.end.is_none() {
            return Ok(LeaseOutcome::NotAcquiredAtAll);
        }

        match self.replace(&lease.name, &lease.token, None).await? {
            Some(etag) => {
                lease.end = None;
                lease.token = etag;
                info!("Lease released");
                Ok(LeaseOutcome::Acquired(()))
            },
            None => Ok(LeaseOutcome::AcquiredBySomeoneElse),
        }
    }

    #[instrument(skip(self))]
    async fn break_lease(&self, name: &str) -> LeaseResult<()> {
        if self.read(name).await?.is_none() {
            debug!("Nothing to break");
            return Ok(());
        }

        let body = LeaseDocument::new(name, None).to_bytes()?;
        self.storage.put(&self.key(name), body).await?;

        info!("Lease broken");
        Ok(())
    }

    async fn get_or_null(&self, name: &str) -> LeaseResult<Option<LeaseRecord>> {
        Ok(self.read(name).await?.map(|(document, etag)| LeaseRecord {
            name: document.name,
            end: document.end,
            token: etag,
        }))
    }
}
