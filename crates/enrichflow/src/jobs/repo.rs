// crates/enrichflow/src/jobs/repo.rs

use crate::api::models::{JobListItem, StatusCounts};
use crate::jobs::model::{truncate_error, Job, JobStatus, NewJob, CATEGORIZE_IMPORT};
use crate::jobs::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Enqueue helpers
    // ----------------------------

    pub async fn enqueue_job(&self, job: NewJob) -> anyhow::Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (job_type, payload, owner_token, run_after, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(&job.owner_token)
        .bind(job.run_after)
        .bind(JobStatus::Queued.as_str())
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(job_id = %id, job_type = %job.job_type, "job enqueued");
        Ok(id)
    }

    pub async fn enqueue_now(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        owner_token: &str,
    ) -> anyhow::Result<Uuid> {
        self.enqueue_job(NewJob::now(job_type, payload, owner_token))
            .await
    }

    pub async fn enqueue_at(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        owner_token: &str,
        run_after: DateTime<Utc>,
    ) -> anyhow::Result<Uuid> {
        self.enqueue_job(NewJob {
            job_type: job_type.to_string(),
            payload,
            owner_token: owner_token.to_string(),
            run_after,
        })
        .await
    }

    /// The producer-facing entry point: schedule categorization of one import.
    pub async fn enqueue_categorize_import(
        &self,
        owner_token: &str,
        import_id: i64,
    ) -> anyhow::Result<Uuid> {
        self.enqueue_now(
            CATEGORIZE_IMPORT,
            json!({ "import_id": import_id }),
            owner_token,
        )
        .await
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Cursor-paginated list of jobs, newest first.
    /// Cursor is (created_on, id) of the last item of the previous page.
    ///
    /// - status/owner are optional filters
    /// - limit is clamped to [1, 500]
    pub async fn list_jobs(
        &self,
        status: Option<&str>,
        owner_token: Option<&str>,
        limit: i64,
        cursor_created_on: Option<DateTime<Utc>>,
        cursor_id: Option<Uuid>,
    ) -> anyhow::Result<Vec<JobListItem>> {
        let limit = limit.clamp(1, 500);

        let rows = sqlx::query_as::<_, JobListItem>(
            r#"
            SELECT
                id, job_type, owner_token, status, attempts,
                locked_by, locked_at, run_after,
                last_error_code, last_error,
                finished_on, created_on
            FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR owner_token = $2)
              AND ($3::timestamptz IS NULL OR (created_on, id) < ($3, $4))
            ORDER BY created_on DESC, id DESC
            LIMIT $5
            "#,
        )
        .bind(status)
        .bind(owner_token)
        .bind(cursor_created_on)
        .bind(cursor_id.unwrap_or_else(|| Uuid::from_u128(u128::MAX)))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn status_counts(&self) -> anyhow::Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match JobStatus::parse(&status) {
                Some(JobStatus::Queued) => counts.queued = n,
                Some(JobStatus::Running) => counts.running = n,
                Some(JobStatus::Done) => counts.done = n,
                Some(JobStatus::Failed) => counts.failed = n,
                None => tracing::warn!(%status, "unexpected job status in table"),
            }
        }
        Ok(counts)
    }

    // ----------------------------
    // Claiming
    // ----------------------------

    /// Lease exactly one runnable job for this worker.
    ///
    /// Correctness: SELECT ... FOR UPDATE SKIP LOCKED inside the UPDATE, so
    /// two workers never claim the same row and neither waits on the other.
    pub async fn claim_next(&self, worker_id: &str) -> anyhow::Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status = 'queued'
                  AND run_after <= now()
                ORDER BY created_on ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE jobs
            SET status = 'running',
                locked_by = $1,
                locked_at = now(),
                attempts = attempts + 1
            WHERE id IN (SELECT id FROM next_job)
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    /// Only the current lease holder can finish a job: `worker_id` and
    /// `attempt` must match the claim that returned it.
    pub async fn mark_done(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempt: i32,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done',
                finished_on = now()
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
              AND attempts = $3
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    pub async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempt: i32,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                finished_on = now(),
                last_error_code = $4,
                last_error = $5
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
              AND attempts = $3
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(attempt)
        .bind(error_code)
        .bind(truncate_error(error_message))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl JobStore for JobsRepo {
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<Uuid> {
        self.enqueue_job(job).await
    }

    async fn claim(&self, worker_id: &str) -> anyhow::Result<Option<Job>> {
        self.claim_next(worker_id).await
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str, attempt: i32) -> anyhow::Result<bool> {
        self.mark_done(job_id, worker_id, attempt).await
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempt: i32,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<bool> {
        self.mark_failed(job_id, worker_id, attempt, error_code, error_message)
            .await
    }
}
