use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::api::models::{JobListItem, StatusCounts};
use crate::jobs::error_codes::suggested_action;
use crate::jobs::maintenance::{MaintenanceRepo, ReapReport};
use crate::jobs::model::{Job, NewJob, CATEGORIZE_IMPORT};
use crate::jobs::JobsRepo;

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub jobs: JobsRepo,
    pub maintenance: MaintenanceRepo,
    pub max_attempts: i32,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Admin / inspect
        .route("/jobs", get(list_jobs).post(enqueue_job))
        .route("/jobs/reap", post(reap_stale))
        .route("/jobs/:id", get(get_job))
        // Metrics
        .route("/metrics", get(metrics))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn internal_err(e: anyhow::Error) -> (StatusCode, String) {
    tracing::error!(error = ?e, "admin api request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("internal error: {e}"),
    )
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub job_type: Option<String>,
    pub owner_token: String,
    pub payload: Value,
    pub run_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
}

/// `categorize_import` payloads must carry a positive integer `import_id`.
pub fn validate_payload(job_type: &str, payload: &Value) -> Result<(), String> {
    if job_type != CATEGORIZE_IMPORT {
        return Ok(());
    }
    match payload.get("import_id").and_then(Value::as_i64) {
        Some(id) if id > 0 => Ok(()),
        Some(_) => Err("import_id must be positive".into()),
        None => Err("payload.import_id (integer) is required".into()),
    }
}

pub async fn enqueue_job(
    State(state): State<ApiState>,
    Json(body): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, (StatusCode, String)> {
    let EnqueueRequest {
        job_type,
        owner_token,
        payload,
        run_after,
    } = body;

    let job_type = job_type.unwrap_or_else(|| CATEGORIZE_IMPORT.to_string());
    if job_type.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "job_type is required".into()));
    }
    if owner_token.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "owner_token is required".into()));
    }
    validate_payload(&job_type, &payload).map_err(|msg| (StatusCode::BAD_REQUEST, msg))?;

    let job_id = state
        .jobs
        .enqueue_job(NewJob {
            job_type,
            payload,
            owner_token,
            run_after: run_after.unwrap_or_else(Utc::now),
        })
        .await
        .map_err(internal_err)?;

    Ok(Json(EnqueueResponse { job_id }))
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub suggested_action: Option<String>,
}

pub async fn get_job(Path(id): Path<Uuid>, State(state): State<ApiState>) -> Response {
    match state.jobs.get_job(id).await {
        Ok(Some(job)) => {
            let suggested_action = job
                .last_error_code
                .as_deref()
                .map(|code| suggested_action(code).to_string());
            (
                StatusCode::OK,
                Json(JobDetail {
                    job,
                    suggested_action,
                }),
            )
                .into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "job not found".into(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: format!("internal error: {e}"),
            }),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub owner_token: Option<String>,
    pub limit: Option<i64>,
    pub cursor_created_on: Option<DateTime<Utc>>,
    pub cursor_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub items: Vec<JobListItem>,
    pub next_cursor_created_on: Option<DateTime<Utc>>,
    pub next_cursor_id: Option<Uuid>,
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, (StatusCode, String)> {
    let items = state
        .jobs
        .list_jobs(
            q.status.as_deref(),
            q.owner_token.as_deref(),
            q.limit.unwrap_or(100),
            q.cursor_created_on,
            q.cursor_id,
        )
        .await
        .map_err(internal_err)?;

    let (next_cursor_created_on, next_cursor_id) = items
        .last()
        .map(|x| (Some(x.created_on), Some(x.id)))
        .unwrap_or((None, None));

    Ok(Json(ListJobsResponse {
        items,
        next_cursor_created_on,
        next_cursor_id,
    }))
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub now_utc: DateTime<Utc>,
    pub total: i64,
    pub counts: StatusCounts,
}

pub async fn metrics(
    State(state): State<ApiState>,
) -> Result<Json<MetricsResponse>, (StatusCode, String)> {
    let counts = state.jobs.status_counts().await.map_err(internal_err)?;
    Ok(Json(MetricsResponse {
        now_utc: Utc::now(),
        total: counts.total(),
        counts,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReapRequest {
    pub older_than_secs: u64,
    pub max_attempts: Option<i32>,
}

pub async fn reap_stale(
    State(state): State<ApiState>,
    Json(body): Json<ReapRequest>,
) -> Result<Json<ReapReport>, (StatusCode, String)> {
    if body.older_than_secs == 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "older_than_secs must be > 0".into(),
        ));
    }
    let max_attempts = body.max_attempts.unwrap_or(state.max_attempts);
    if max_attempts <= 0 {
        return Err((StatusCode::BAD_REQUEST, "max_attempts must be > 0".into()));
    }

    let report = state
        .maintenance
        .requeue_stale(Duration::from_secs(body.older_than_secs), max_attempts)
        .await
        .map_err(internal_err)?;
    Ok(Json(report))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn categorize_payload_requires_positive_import_id() {
        assert!(validate_payload(CATEGORIZE_IMPORT, &json!({ "import_id": 12 })).is_ok());
        assert!(validate_payload(CATEGORIZE_IMPORT, &json!({ "import_id": 0 })).is_err());
        assert!(validate_payload(CATEGORIZE_IMPORT, &json!({ "import_id": "12" })).is_err());
        assert!(validate_payload(CATEGORIZE_IMPORT, &json!({})).is_err());
    }

    #[test]
    fn other_job_types_pass_through() {
        assert!(validate_payload("reindex", &json!(null)).is_ok());
    }
}
