use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// The one job type producers enqueue today.
pub const CATEGORIZE_IMPORT: &str = "categorize_import";

/// Upper bound (in characters) for `last_error`.
pub const MAX_ERROR_CHARS: usize = 2000;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: Value,
    pub owner_token: String,
    pub status: String,
    pub attempts: i32,

    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub run_after: DateTime<Utc>,

    pub last_error: Option<String>,
    pub last_error_code: Option<String>,

    pub finished_on: Option<DateTime<Utc>>,
    pub created_on: DateTime<Utc>,
}

impl Job {
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub owner_token: String,
    pub run_after: DateTime<Utc>,
}

impl NewJob {
    pub fn now(job_type: &str, payload: Value, owner_token: &str) -> Self {
        Self {
            job_type: job_type.to_string(),
            payload,
            owner_token: owner_token.to_string(),
            run_after: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Cap an error message at [`MAX_ERROR_CHARS`] characters without splitting a
/// UTF-8 sequence.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_CHARS) {
        Some((byte_idx, _)) => message[..byte_idx].to_string(),
        None => message.to_string(),
    }
}
