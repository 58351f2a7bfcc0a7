//! One active worker per named responsibility
//!
//! The coordinator caches the lease handle behind a local async mutex, so
//! concurrent calls inside one process never race each other; the lease
//! itself arbitrates between processes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lease::{Lease, LeaseError, LeaseOutcome, LeaseResult, LeaseService};

/// Lower bound for [`SingletonCoordinator::spawn_auto_renew`]
pub const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

pub struct SingletonCoordinator {
    name: String,
    lease_duration: Duration,
    leases: Arc<dyn LeaseService>,
    current: Mutex<Option<Lease>>,
}

impl SingletonCoordinator {
    pub fn new(
        leases: Arc<dyn LeaseService>,
        name: impl Into<String>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            lease_duration,
            leases,
            current: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_held(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Acquire the lease on first call, renew it afterwards
    pub async fn acquire_or_renew(&self) -> LeaseResult<()> {
        let mut current = self.current.lock().await;
        if current.is_some() {
            return self.renew_locked(&mut current).await;
        }

        let lease = self.leases.acquire(&self.name, self.lease_duration).await?;
        info!(singleton = %self.name, end = ?lease.end, "Singleton lease acquired");
        *current = Some(lease);
        Ok(())
    }

    /// Renew only; fails if the lease was never acquired
    pub async fn renew(&self) -> LeaseResult<()> {
        let mut current = self.current.lock().await;
        self.renew_locked(&mut current).await
    }

    async fn renew_locked(&self, current: &mut Option<Lease>) -> LeaseResult<()> {
        let Some(lease) = current.as_mut() else {
            return Err(LeaseError::NotAcquiredAtAll(self.name.clone()));
        };

        match self.leases.try_renew(lease, self.lease_duration).await? {
            LeaseOutcome::Acquired(()) => {
                debug!(singleton = %self.name, end = ?lease.end, "Singleton lease renewed");
                Ok(())
            },
            lost => {
                *current = None;
                warn!(singleton = %self.name, "Singleton lease was lost");
                lost.into_result(&self.name)
            },
        }
    }

    /// Hand the lease off.
    ///
    /// A zero duration releases immediately. Otherwise the lease is renewed
    /// for exactly `duration` and left to lapse, giving this process a window
    /// to finish before another worker can take over. Losing the lease on the
    /// way out is logged, not returned.
    pub async fn release_in(&self, duration: Duration) -> LeaseResult<()> {
        let Some(mut lease) = self.current.lock().await.take() else {
            debug!(singleton = %self.name, "No singleton lease to release");
            return Ok(());
        };

        let outcome = if duration.is_zero() {
            self.leases.try_release(&mut lease).await?
        } else {
            self.leases.try_renew(&mut lease, duration).await?
        };

        match outcome {
            LeaseOutcome::Acquired(()) => {
                info!(singleton = %self.name, end = ?lease.end, "Singleton lease handed off");
            },
            _ => {
                warn!(
                    singleton = %self.name,
                    "Singleton lease was already taken by someone else during release"
                );
            },
        }

        Ok(())
    }

    /// Make the lease available to anyone and forget the local handle
    pub async fn break_lease(&self) -> LeaseResult<()> {
        let mut current = self.current.lock().await;
        self.leases.break_lease(&self.name).await?;
        *current = None;
        warn!(singleton = %self.name, "Singleton lease broken");
        Ok(())
    }

    /// Renew every `interval` until `cancel` fires.
    ///
    /// A zero `interval` means half the lease duration. The effective interval
    /// is never shorter than [`MIN_RENEW_INTERVAL`].
    ///
    /// A failed renewal cancels `cancel` so whoever is collecting under this
    /// lease stops, then ends the task with that error.
    pub fn spawn_auto_renew(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<LeaseResult<()>> {
        let interval = self.renew_interval(interval);
        debug!(singleton = %self.name, ?interval, "Starting lease auto-renewal");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = ticker.tick() => {},
                }

                if let Err(err) = this.renew().await {
                    error!(singleton = %this.name, error = %err, "Singleton renewal failed");
                    cancel.cancel();
                    return Err(err);
                }
            }
        })
    }

    fn renew_interval(&self, requested: Duration) -> Duration {
        let interval = if requested.is_zero() {
            self.lease_duration / 2
        } else {
            requested
        };
        interval.max(MIN_RENEW_INTERVAL)
    }
}
