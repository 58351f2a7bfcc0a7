//! Lease backends against real PostgreSQL and MinIO
//!
//! Both backends must behave identically, so every scenario runs through the
//! same helpers with a different `LeaseService`.

mod common;

use anyhow::Result;
use chrono::Utc;
use common::{init_tracing, TestMinio, TestPostgres};
use feedline_core::lease::{
    DatabaseLeaseService, LeaseError, LeaseOutcome, LeaseService, StorageLeaseService,
};
use feedline_core::storage::StorageError;
use feedline_core::SingletonCoordinator;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

async fn check_acquire_renew_release(leases: &dyn LeaseService) -> Result<()> {
    let mut lease = leases.acquire("collector", HOUR).await?;
    assert!(lease.end.is_some_and(|end| end > Utc::now()));

    assert!(matches!(
        leases.try_acquire("collector", HOUR).await?,
        LeaseOutcome::NotAvailable
    ));

    let before = lease.token.clone();
    assert!(leases.try_renew(&mut lease, HOUR).await?.is_acquired());
    assert_ne!(lease.token, before);

    assert!(leases.try_release(&mut lease).await?.is_acquired());
    assert!(lease.end.is_none());
    assert!(matches!(
        leases.try_renew(&mut lease, HOUR).await?,
        LeaseOutcome::NotAcquiredAtAll
    ));

    let record = leases.get_or_null("collector").await?.expect("lease record");
    assert!(!record.is_held_at(Utc::now()));

    leases.acquire("collector", HOUR).await?;
    Ok(())
}

async fn check_expired_lease_is_taken_over(leases: &dyn LeaseService) -> Result<()> {
    let mut stale = leases.acquire("expiring", Duration::from_secs(1)).await?;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let fresh = leases.acquire("expiring", HOUR).await?;
    assert_ne!(fresh.token, stale.token);

    assert!(matches!(
        leases.try_renew(&mut stale, HOUR).await?,
        LeaseOutcome::AcquiredBySomeoneElse
    ));
    Ok(())
}

async fn check_break_lease(leases: &dyn LeaseService) -> Result<()> {
    leases.break_lease("nobody-holds-this").await?;
    assert!(leases.get_or_null("nobody-holds-this").await?.is_none());

    let mut held = leases.acquire("stuck", HOUR).await?;
    leases.break_lease("stuck").await?;

    assert!(matches!(
        leases.renew(&mut held, HOUR).await,
        Err(LeaseError::AcquiredBySomeoneElse(_))
    ));
    leases.acquire("stuck", HOUR).await?;
    Ok(())
}

async fn check_only_one_contender_wins(leases: Arc<dyn LeaseService>) -> Result<()> {
    let mut handles = Vec::new();
    for _ in 0..8 {
        let leases = Arc::clone(&leases);
        handles.push(tokio::spawn(async move {
            leases.try_acquire("contended", HOUR).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await??.is_acquired() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    Ok(())
}

async fn check_singleton_hand_off(leases: Arc<dyn LeaseService>) -> Result<()> {
    let first = SingletonCoordinator::new(Arc::clone(&leases), "singleton", HOUR);
    let second = SingletonCoordinator::new(Arc::clone(&leases), "singleton", HOUR);

    first.acquire_or_renew().await?;
    assert!(second.acquire_or_renew().await.is_err());

    first.release_in(Duration::ZERO).await?;
    second.acquire_or_renew().await?;
    second.renew().await?;
    assert!(second.is_held().await);
    Ok(())
}

// ============================================================================
// PostgreSQL backend
// ============================================================================

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_database_lease_lifecycle() -> Result<()> {
    init_tracing();
    let pg = TestPostgres::start().await?;
    let leases = DatabaseLeaseService::new(pg.pool_clone());

    check_acquire_renew_release(&leases).await?;
    check_expired_lease_is_taken_over(&leases).await?;
    check_break_lease(&leases).await
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_database_lease_mutual_exclusion() -> Result<()> {
    init_tracing();
    let pg = TestPostgres::start().await?;
    let leases: Arc<dyn LeaseService> = Arc::new(DatabaseLeaseService::new(pg.pool_clone()));

    check_only_one_contender_wins(Arc::clone(&leases)).await?;
    check_singleton_hand_off(leases).await
}

// ============================================================================
// S3 backend
// ============================================================================

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_storage_lease_lifecycle() -> Result<()> {
    init_tracing();
    let minio = TestMinio::start().await?;
    let leases = StorageLeaseService::new(minio.storage(), "leases/");

    check_acquire_renew_release(&leases).await?;
    check_expired_lease_is_taken_over(&leases).await?;
    check_break_lease(&leases).await
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_storage_lease_mutual_exclusion() -> Result<()> {
    init_tracing();
    let minio = TestMinio::start().await?;
    let leases: Arc<dyn LeaseService> =
        Arc::new(StorageLeaseService::new(minio.storage_from_client(), "leases/"));

    check_only_one_contender_wins(Arc::clone(&leases)).await?;
    check_singleton_hand_off(leases).await
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_storage_conditional_writes() -> Result<()> {
    init_tracing();
    let minio = TestMinio::start().await?;
    let storage = minio.storage();
    storage.ensure_bucket().await?;

    let first = storage.put_if_absent("conditional.json", b"1".to_vec()).await?;
    assert!(matches!(
        storage.put_if_absent("conditional.json", b"2".to_vec()).await,
        Err(StorageError::PreconditionFailed { .. })
    ));

    let second = storage.put_if_match("conditional.json", b"3".to_vec(), &first).await?;
    assert_ne!(first, second);
    assert!(matches!(
        storage.put_if_match("conditional.json", b"4".to_vec(), &first).await,
        Err(StorageError::PreconditionFailed { .. })
    ));

    let object = storage.get_versioned("conditional.json").await?.expect("object");
    assert_eq!(object.body, b"3");
    assert_eq!(object.etag, second);
    assert!(storage.get_versioned("missing.json").await?.is_none());
    Ok(())
}
