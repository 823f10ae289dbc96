// crates/enrichflow/src/api/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobListItem {
    pub id: Uuid,
    pub job_type: String,
    pub owner_token: String,
    pub status: String,
    pub attempts: i32,

    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub run_after: DateTime<Utc>,

    pub last_error_code: Option<String>,
    pub last_error: Option<String>,

    pub finished_on: Option<DateTime<Utc>>,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.queued + self.running + self.done + self.failed
    }
}
