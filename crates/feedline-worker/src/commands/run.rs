//! `feedline-worker run` command implementation
//!
//! Takes the singleton lease, keeps it renewed in the background, and runs the
//! registration summary collector once or until interrupted.

use anyhow::{Context, Result};
use feedline_core::collector::{CollectorOptions, PgProgressStore};
use feedline_core::config::Config;
use feedline_core::cursor::PgCursorStore;
use feedline_core::lease::LeaseResult;
use feedline_core::{PipelineError, SingletonCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::registration::{self, RegistrationCollector};
use crate::{services, RunArgs};

/// Run the stage until it catches up, or forever with `--daemon`.
///
/// `interrupt` fires on a shutdown signal. The lease is then handed off with
/// the configured release delay; a normal exit releases it immediately.
pub async fn run(config: &Config, args: &RunArgs, interrupt: CancellationToken) -> Result<()> {
    let pool = services::connect(config).await?;
    let leases = services::lease_service(config, &pool).await?;

    let singleton = Arc::new(SingletonCoordinator::new(
        leases,
        config.pipeline.singleton_name.clone(),
        config.pipeline.singleton_lease_duration(),
    ));
    singleton
        .acquire_or_renew()
        .await
        .with_context(|| format!("Could not take singleton lease {}", singleton.name()))?;

    let options = CollectorOptions {
        mode: args.mode,
        queue: config.pipeline.queue(),
    };
    let collector = registration::collector(
        pool.clone(),
        Arc::new(PgCursorStore::new(pool.clone())),
        Arc::new(PgProgressStore::new(pool)),
        config.pipeline.batch_size,
        options,
    )?
    .with_singleton(Arc::clone(&singleton));

    // Cancelled by the interrupt or by a failed background renewal.
    let cancel = interrupt.child_token();
    let renewal = singleton.spawn_auto_renew(config.pipeline.renew_interval(), cancel.clone());

    let outcome = collect(&collector, args, &cancel).await;

    cancel.cancel();
    let release_in = if interrupt.is_cancelled() {
        config.pipeline.release_in()
    } else {
        Duration::ZERO
    };
    hand_off(&singleton, renewal, release_in).await?;
    outcome
}

/// Stop renewing and release the singleton, then report how renewal ended.
///
/// The lease is released even when the renewal task panicked.
async fn hand_off(
    singleton: &SingletonCoordinator,
    renewal: JoinHandle<LeaseResult<()>>,
    release_in: Duration,
) -> Result<()> {
    let renewed = renewal.await;

    if let Err(err) = singleton.release_in(release_in).await {
        warn!(error = %err, "Failed to release singleton lease");
    }

    renewed
        .context("Lease renewal task panicked")?
        .context("Singleton lease renewal failed")
}

async fn collect(
    collector: &RegistrationCollector,
    args: &RunArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let sleep = match collector.run(cancel).await {
            Ok(report) => {
                info!(
                    rounds = report.rounds,
                    commits = report.commits,
                    items = report.items,
                    cursor = %report.cursor,
                    "Run completed"
                );
                args.success_sleep
            },
            Err(PipelineError::Cancelled) => {
                info!("Run cancelled");
                return Ok(());
            },
            Err(err @ PipelineError::Lease(_)) => {
                return Err(err).context("Lost the singleton lease");
            },
            Err(err) if !args.daemon || !err.is_retryable() => {
                return Err(err).context("Collection failed");
            },
            Err(err) => {
                error!(error = %err, retry_in_secs = args.failure_sleep, "Run failed");
                args.failure_sleep
            },
        };

        if !args.daemon {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Stopping daemon");
                return Ok(());
            },
            _ = tokio::time::sleep(Duration::from_secs(sleep)) => {},
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use feedline_core::lease::{LeaseError, LeaseService, MemoryLeaseService};

    const HOUR: Duration = Duration::from_secs(3600);

    async fn held_singleton(leases: &Arc<MemoryLeaseService>) -> SingletonCoordinator {
        let singleton = SingletonCoordinator::new(leases.clone(), "feedline-singleton", HOUR);
        singleton.acquire_or_renew().await.unwrap();
        singleton
    }

    #[tokio::test]
    async fn test_hand_off_releases_after_clean_renewal() {
        let leases = Arc::new(MemoryLeaseService::new());
        let singleton = held_singleton(&leases).await;

        let renewal = tokio::spawn(async { Ok(()) });
        hand_off(&singleton, renewal, Duration::ZERO).await.unwrap();

        assert!(!singleton.is_held().await);
        assert!(leases.try_acquire("feedline-singleton", HOUR).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_hand_off_releases_when_renewal_panicked() {
        let leases = Arc::new(MemoryLeaseService::new());
        let singleton = held_singleton(&leases).await;

        let renewal: JoinHandle<LeaseResult<()>> =
            tokio::spawn(async { panic!("renewal task crashed") });
        let err = hand_off(&singleton, renewal, Duration::ZERO).await.unwrap_err();

        assert!(err.to_string().contains("panicked"));
        assert!(!singleton.is_held().await);
        assert!(leases.try_acquire("feedline-singleton", HOUR).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_hand_off_reports_failed_renewal() {
        let leases = Arc::new(MemoryLeaseService::new());
        let singleton = held_singleton(&leases).await;

        let renewal = tokio::spawn(async {
            Err(LeaseError::AcquiredBySomeoneElse("feedline-singleton".to_string()))
        });
        let err = hand_off(&singleton, renewal, Duration::ZERO).await.unwrap_err();

        assert!(err.to_string().contains("renewal failed"));
        assert!(!singleton.is_held().await);
    }
}
