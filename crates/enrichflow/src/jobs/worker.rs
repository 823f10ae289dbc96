use crate::jobs::error_codes::ErrorCode;
use crate::jobs::registry::{HandlerRegistry, JobContext, JobError};
use crate::jobs::runner::JobRunner;
use crate::jobs::store::JobStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: Duration::from_millis(crate::config::DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn poll_interval(mut self, dur: Duration) -> Self {
        self.poll_interval = dur;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was claimable (or the claim itself errored).
    Idle,
    Completed(Uuid),
    Failed { job_id: Uuid, code: String },
}

/// Claims one job at a time and runs it to a terminal state.
pub struct Worker {
    jobs: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    runner: JobRunner,
    ctx: JobContext,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(jobs: Arc<dyn JobStore>, registry: HandlerRegistry, cfg: WorkerConfig) -> Self {
        Self {
            runner: JobRunner::new(jobs.clone()),
            jobs,
            registry: Arc::new(registry),
            ctx: JobContext {
                worker_id: cfg.worker_id,
            },
            poll_interval: cfg.poll_interval,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.ctx.worker_id
    }

    /// One claim-and-run step.
    ///
    /// A store error while claiming is logged and reported as `Idle`; the
    /// loop keeps going. An error while recording the outcome is returned.
    pub async fn tick(&self) -> anyhow::Result<TickOutcome> {
        let worker_id = self.ctx.worker_id.as_str();

        let job = match self.jobs.claim(worker_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(TickOutcome::Idle),
            Err(e) => {
                tracing::error!(worker_id, error = ?e, "claim failed");
                return Ok(TickOutcome::Idle);
            }
        };

        let job_id = job.id;
        let attempt = job.attempts;
        tracing::debug!(
            %job_id,
            worker_id,
            job_type = %job.job_type,
            attempts = job.attempts,
            "claimed job"
        );

        let start = Instant::now();
        let result: Result<(), JobError> = match self.registry.handler_for(&job.job_type) {
            Some(entry) => {
                let ctx = self.ctx.clone();
                // Run on its own task so a panicking handler fails the job
                // instead of taking the loop down.
                match tokio::spawn(async move { entry.run(&job, &ctx).await }).await {
                    Ok(res) => res,
                    Err(join_err) => Err(JobError::with_code(
                        ErrorCode::Panic,
                        format!("handler task aborted: {join_err}"),
                    )),
                }
            }
            None => Err(JobError::with_code(
                ErrorCode::UnknownJobType,
                format!("no handler for job_type={}", job.job_type),
            )),
        };
        let latency_ms = start.elapsed().as_millis();

        match result {
            Ok(()) => {
                self.runner
                    .on_success(job_id, worker_id, attempt, latency_ms)
                    .await?;
                Ok(TickOutcome::Completed(job_id))
            }
            Err(err) => {
                self.runner
                    .on_failure(
                        job_id,
                        worker_id,
                        attempt,
                        latency_ms,
                        err.code,
                        &err.message,
                    )
                    .await?;
                Ok(TickOutcome::Failed {
                    job_id,
                    code: err.code.to_string(),
                })
            }
        }
    }

    /// Poll until `shutdown` is cancelled. A job that is mid-flight finishes
    /// before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        tracing::info!(
            worker_id = %self.ctx.worker_id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            job_types = ?self.registry.job_types(),
            "worker loop started"
        );

        while !shutdown.is_cancelled() {
            let idle = match self.tick().await {
                Ok(TickOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    tracing::error!(worker_id = %self.ctx.worker_id, error = ?e, "recording job outcome failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        tracing::info!(worker_id = %self.ctx.worker_id, "worker loop stopped");
        Ok(())
    }
}
