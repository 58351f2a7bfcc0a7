//! `leases` table backend
//!
//! Each row carries a `version` token that every write replaces. Writes are
//! `UPDATE ... WHERE version = <observed>`; zero affected rows means another
//! writer got there first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedline_common::time::add_duration;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{Lease, LeaseOutcome, LeaseRecord, LeaseResult, LeaseService};

#[derive(Clone)]
pub struct DatabaseLeaseService {
    pool: PgPool,
}

impl DatabaseLeaseService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Replace `end` and rotate the version, only if the version is `expected`
    async fn compare_and_set(
        &self,
        name: &str,
        expected: &str,
        end: Option<DateTime<Utc>>,
    ) -> LeaseResult<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            UPDATE leases
            SET lease_end = $2, version = $3, updated_at = NOW()
            WHERE name = $1 AND version = $4
            "#,
        )
        .bind(name)
        .bind(end)
        .bind(&token)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() == 1).then_some(token))
    }
}

#[async_trait]
impl LeaseService for DatabaseLeaseService {
    #[instrument(skip(self))]
    async fn try_acquire(
        &self,
        name: &str,
        duration: Duration,
    ) -> LeaseResult<LeaseOutcome<Lease>> {
        let now = Utc::now();
        let end = add_duration(now, duration);

        let existing: Option<(Option<DateTime<Utc>>, String)> =
            sqlx::query_as("SELECT lease_end, version FROM leases WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        let token = match existing {
            None => {
                let token = Uuid::new_v4().to_string();
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO leases (name, lease_end, version, updated_at)
                    VALUES ($1, $2, $3, NOW())
                    ON CONFLICT (name) DO NOTHING
                    "#,
                )
                .bind(name)
                .bind(end)
                .bind(&token)
                .execute(&self.pool)
                .await?;

                if inserted.rows_affected() == 0 {
                    debug!("Lost the race to create the lease");
                    return Ok(LeaseOutcome::NotAvailable);
                }
                token
            },
            Some((Some(current_end), _)) if current_end > now => {
                return Ok(LeaseOutcome::NotAvailable);
            },
            Some((_, version)) => match self.compare_and_set(name, &version, Some(end)).await? {
                Some(token) => token,
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
        match self.compare_and_set(&lease.name, &lease.token, Some(end)).await? {
            Some(token) => {
                lease.end = Some(end);
                lease.token = token;
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

        match self.compare_and_set(&lease.name, &lease.token, None).await? {
            Some(token) => {
                lease.end = None;
                lease.token = token;
                info!("Lease released");
                Ok(LeaseOutcome::Acquired(()))
            },
            None => Ok(LeaseOutcome::AcquiredBySomeoneElse),
        }
    }

    #[instrument(skip(self))]
    async fn break_lease(&self, name: &str) -> LeaseResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE leases
            SET lease_end = NULL, version = $2, updated_at = NOW()
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(Uuid::new_v4().to_string())
        .execute(&self.pool)
        .await?;

        info!(found = result.rows_affected() > 0, "Lease broken");
        Ok(())
    }

    async fn get_or_null(&self, name: &str) -> LeaseResult<Option<LeaseRecord>> {
        let row: Option<(String, Option<DateTime<Utc>>, String)> =
            sqlx::query_as("SELECT name, lease_end, version FROM leases WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(name, end, token)| LeaseRecord { name, end, token }))
    }
}
