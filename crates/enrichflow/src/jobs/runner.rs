use crate::jobs::store::JobStore;
use std::sync::Arc;
use uuid::Uuid;

/// Records the terminal outcome of one execution.
///
/// There is no retry policy: a failed job stays failed until someone enqueues
/// fresh work for the same import.
#[derive(Clone)]
pub struct JobRunner {
    jobs: Arc<dyn JobStore>,
}

impl JobRunner {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    pub async fn on_success(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempt: i32,
        latency_ms: u128,
    ) -> anyhow::Result<()> {
        let updated = self.jobs.complete(job_id, worker_id, attempt).await?;
        if updated {
            tracing::info!(%job_id, worker_id, latency_ms, "job done");
        } else {
            // Lease lost: reaped and reclaimed, or a repeated call.
            tracing::warn!(%job_id, worker_id, "job was no longer running when marking done");
        }
        Ok(())
    }

    pub async fn on_failure(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempt: i32,
        latency_ms: u128,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<()> {
        let updated = self
            .jobs
            .fail(job_id, worker_id, attempt, error_code, error_message)
            .await?;
        if updated {
            tracing::warn!(
                %job_id,
                worker_id,
                latency_ms,
                error_code,
                error = %error_message,
                "job failed"
            );
        } else {
            tracing::warn!(
                %job_id,
                worker_id,
                error_code,
                "job was no longer running when marking failed"
            );
        }
        Ok(())
    }
}
