use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::truncate_error;
use sqlx::PgPool;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReapReport {
    pub requeued: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct MaintenanceRepo {
    pool: PgPool,
}

impl MaintenanceRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Recover jobs stuck in `running` for longer than `older_than`.
    ///
    /// Jobs that have been claimed fewer than `max_attempts` times go back to
    /// `queued`; the rest become `failed` with `LEASE_EXPIRED`. Both updates
    /// skip rows another session is currently touching.
    pub async fn requeue_stale(
        &self,
        older_than: Duration,
        max_attempts: i32,
    ) -> anyhow::Result<ReapReport> {
        let secs = older_than.as_secs_f64();
        let mut tx = self.pool.begin().await?;

        let requeued = sqlx::query(
            r#"
            WITH stale AS (
                SELECT id
                FROM jobs
                WHERE status = 'running'
                  AND locked_at < now() - make_interval(secs => $1)
                  AND attempts < $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'queued',
                locked_by = NULL,
                locked_at = NULL
            WHERE id IN (SELECT id FROM stale)
            "#,
        )
        .bind(secs)
        .bind(max_attempts)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let message = truncate_error(&format!(
            "job stayed running longer than {}s after {} claims",
            older_than.as_secs(),
            max_attempts
        ));
        let failed = sqlx::query(
            r#"
            WITH stale AS (
                SELECT id
                FROM jobs
                WHERE status = 'running'
                  AND locked_at < now() - make_interval(secs => $1)
                  AND attempts >= $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'failed',
                finished_on = now(),
                last_error_code = $3,
                last_error = $4
            WHERE id IN (SELECT id FROM stale)
            "#,
        )
        .bind(secs)
        .bind(max_attempts)
        .bind(ErrorCode::LeaseExpired.as_str())
        .bind(message)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        let report = ReapReport { requeued, failed };
        if requeued > 0 || failed > 0 {
            tracing::warn!(requeued, failed, older_than_secs = older_than.as_secs(), "reaped stale running jobs");
        }
        Ok(report)
    }
}
