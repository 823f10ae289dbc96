mod common;

use common::setup_db;

use enrichflow::jobs::{JobStatus, JobsRepo, MaintenanceRepo};
use serial_test::serial;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

async fn age_lock(pool: &PgPool, id: Uuid, secs: i64) {
    sqlx::query("UPDATE jobs SET locked_at = now() - make_interval(secs => $2) WHERE id = $1")
        .bind(id)
        .bind(secs as f64)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
#[serial]
async fn stale_jobs_are_requeued_below_the_attempt_cap() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool.clone());
    let maint = MaintenanceRepo::new(pool.clone());

    let stale = repo.enqueue_categorize_import("o", 1).await.unwrap();
    let fresh = repo.enqueue_categorize_import("o", 2).await.unwrap();
    repo.claim_next("crashed").await.unwrap().unwrap();
    repo.claim_next("alive").await.unwrap().unwrap();
    age_lock(&pool, stale, 600).await;

    let report = maint
        .requeue_stale(Duration::from_secs(300), 5)
        .await
        .unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.failed, 0);

    let job = repo.get_job(stale).await.unwrap().unwrap();
    assert_eq!(job.status(), Some(JobStatus::Queued));
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());
    assert_eq!(job.attempts, 1);

    let job = repo.get_job(fresh).await.unwrap().unwrap();
    assert_eq!(job.status(), Some(JobStatus::Running));

    let again = repo.claim_next("w2").await.unwrap().unwrap();
    assert_eq!(again.id, stale);
    assert_eq!(again.attempts, 2);
}

#[tokio::test]
#[serial]
async fn stale_jobs_at_the_cap_fail_with_lease_expired() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool.clone());
    let maint = MaintenanceRepo::new(pool.clone());

    let id = repo.enqueue_categorize_import("o", 1).await.unwrap();
    repo.claim_next("crashed").await.unwrap().unwrap();
    age_lock(&pool, id, 600).await;

    let report = maint
        .requeue_stale(Duration::from_secs(300), 1)
        .await
        .unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(report.failed, 1);

    let job = repo.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status(), Some(JobStatus::Failed));
    assert_eq!(job.last_error_code.as_deref(), Some("LEASE_EXPIRED"));
    assert!(job.finished_on.is_some());

    // a late completion from the crashed worker is ignored
    assert!(!repo.mark_done(id, "crashed", 1).await.unwrap());
}

#[tokio::test]
#[serial]
async fn stalled_worker_cannot_finish_a_reclaimed_job() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool.clone());
    let maint = MaintenanceRepo::new(pool.clone());

    let id = repo.enqueue_categorize_import("o", 1).await.unwrap();
    let first = repo.claim_next("slow-a").await.unwrap().unwrap();
    age_lock(&pool, id, 600).await;

    let report = maint
        .requeue_stale(Duration::from_secs(300), 5)
        .await
        .unwrap();
    assert_eq!(report.requeued, 1);
    let second = repo.claim_next("worker-b").await.unwrap().unwrap();
    assert_eq!(second.id, id);

    assert!(!repo
        .mark_failed(id, "slow-a", first.attempts, "CLASSIFIER_UNAVAILABLE", "late")
        .await
        .unwrap());
    assert!(!repo.mark_done(id, "slow-a", first.attempts).await.unwrap());

    let job = repo.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status(), Some(JobStatus::Running));
    assert_eq!(job.locked_by.as_deref(), Some("worker-b"));
    assert!(job.last_error_code.is_none());

    assert!(repo.mark_done(id, "worker-b", second.attempts).await.unwrap());
    let job = repo.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status(), Some(JobStatus::Done));
}

#[tokio::test]
#[serial]
async fn same_worker_reclaiming_does_not_revive_its_old_lease() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool.clone());
    let maint = MaintenanceRepo::new(pool.clone());

    let id = repo.enqueue_categorize_import("o", 1).await.unwrap();
    let first = repo.claim_next("w1").await.unwrap().unwrap();
    age_lock(&pool, id, 600).await;
    maint
        .requeue_stale(Duration::from_secs(300), 5)
        .await
        .unwrap();
    let second = repo.claim_next("w1").await.unwrap().unwrap();
    assert_eq!(second.attempts, first.attempts + 1);

    assert!(!repo.mark_done(id, "w1", first.attempts).await.unwrap());
    assert!(repo.mark_done(id, "w1", second.attempts).await.unwrap());
}
