use async_trait::async_trait;
use uuid::Uuid;

use crate::jobs::model::{Job, NewJob};

/// Durable job storage with atomic lease acquisition.
///
/// `claim` is the only operation that needs mutual exclusion: two concurrent
/// callers must never receive the same job, and a caller must never wait on a
/// row another caller is leasing.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<Uuid>;

    /// Lease the oldest eligible queued job (FIFO by `created_on`, then `id`).
    async fn claim(&self, worker_id: &str) -> anyhow::Result<Option<Job>>;

    /// `running -> done` for the lease identified by `worker_id` and
    /// `attempt`. Returns false if that lease no longer holds the job: it
    /// already finished, or the reaper requeued it and it was claimed again.
    async fn complete(&self, job_id: Uuid, worker_id: &str, attempt: i32) -> anyhow::Result<bool>;

    /// `running -> failed` under the same lease check, storing a truncated
    /// error message.
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempt: i32,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<bool>;
}
