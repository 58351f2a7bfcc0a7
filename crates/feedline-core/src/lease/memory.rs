//! Process-local lease store

use async_trait::async_trait;
use chrono::Utc;
use feedline_common::time::add_duration;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Lease, LeaseOutcome, LeaseRecord, LeaseResult, LeaseService};

#[derive(Debug, Default)]
pub struct MemoryLeaseService {
    records: Mutex<HashMap<String, LeaseRecord>>,
}

impl MemoryLeaseService {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_token() -> String {
    Uuid::new_v4().to_string()
}

#[async_trait]
impl LeaseService for MemoryLeaseService {
    async fn try_acquire(
        &self,
        name: &str,
        duration: Duration,
    ) -> LeaseResult<LeaseOutcome<Lease>> {
        let now = Utc::now();
        let mut records = self.records.lock().await;

        if records.get(name).is_some_and(|r| r.is_held_at(now)) {
            return Ok(LeaseOutcome::NotAvailable);
        }

        let record = LeaseRecord {
            name: name.to_string(),
            end: Some(add_duration(now, duration)),
            token: new_token(),
        };
        let lease = Lease {
            name: record.name.clone(),
            end: record.end,
            token: record.token.clone(),
        };
        records.insert(name.to_string(), record);

        Ok(LeaseOutcome::Acquired(lease))
    }

    async fn try_renew(
        &self,
        lease: &mut Lease,
        duration: Duration,
    ) -> LeaseResult<LeaseOutcome<()>> {
        if lease.end.is_none() {
            return Ok(LeaseOutcome::NotAcquiredAtAll);
        }

        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&lease.name).filter(|r| r.token == lease.token) else {
            return Ok(LeaseOutcome::AcquiredBySomeoneElse);
        };

        record.end = Some(add_duration(Utc::now(), duration));
        record.token = new_token();
        lease.end = record.end;
        lease.token = record.token.clone();

        Ok(LeaseOutcome::Acquired(()))
    }

    async fn try_release(&self, lease: &mut Lease) -> LeaseResult<LeaseOutcome<()>> {
        if lease.end.is_none() {
            return Ok(LeaseOutcome::NotAcquiredAtAll);
        }

        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&lease.name).filter(|r| r.token == lease.token) else {
            return Ok(LeaseOutcome::AcquiredBySomeoneElse);
        };

        record.end = None;
        record.token = new_token();
        lease.end = None;
        lease.token = record.token.clone();

        Ok(LeaseOutcome::Acquired(()))
    }

    async fn break_lease(&self, name: &str) -> LeaseResult<()> {
        if let Some(record) = self.records.lock().await.get_mut(name) {
            record.end = None;
            record.token = new_token();
        }
        Ok(())
    }

    async fn get_or_null(&self, name: &str) -> LeaseResult<Option<LeaseRecord>> {
        Ok(self.records.lock().await.get(name).cloned())
    }
}
