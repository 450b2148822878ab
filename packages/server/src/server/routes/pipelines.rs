//! Pipeline runner endpoints: job listings and manual triggers.

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::kernel::jobs::{JobStatus, ListOptions, WorkerRegistry};
use crate::server::app::AppState;

const MAX_PAGE_SIZE: i64 = 1000;
const DEFAULT_PAGE_SIZE: i64 = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub tab: Option<String>,
    pub include_total: Option<bool>,
}

fn error_body(message: impl Into<String>) -> Json<Value> {
    Json(json!({
        "message": message.into(),
        "timestamp": Utc::now(),
    }))
}

fn unknown_pipeline(id: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        error_body(format!(
            "unknown pipeline {id:?}; supported pipelines: {}",
            WorkerRegistry::supported().join(", ")
        )),
    )
}

/// GET /api/sidequest/pipeline-runners/:id/jobs
pub async fn list_pipeline_jobs(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !WorkerRegistry::is_supported(&id) {
        return Err(unknown_pipeline(&id));
    }

    let status = match query.status.as_deref() {
        Some(raw) => Some(JobStatus::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                error_body(format!("unknown status {raw:?}")),
            )
        })?),
        None => None,
    };

    let opts = ListOptions {
        status,
        tab: query.tab,
        limit: query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE),
        offset: query.offset.unwrap_or(0).max(0),
        include_total: query.include_total.unwrap_or(false),
    };

    let page = state.store.list(&id, &opts).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body(format!("listing jobs failed: {e}")),
        )
    })?;

    let has_more = match page.total {
        Some(total) => opts.offset + (page.jobs.len() as i64) < total,
        None => page.jobs.len() as i64 == opts.limit,
    };

    Ok(Json(json!({
        "jobs": page.jobs,
        "total": page.total,
        "hasMore": has_more,
    })))
}

#[derive(Debug, Deserialize, Default)]
pub struct TriggerRequest {
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// POST /api/sidequest/pipeline-runners/:id/trigger
pub async fn trigger_pipeline(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    body: Option<Json<TriggerRequest>>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let worker = state
        .registry
        .get_worker(&id)
        .await
        .map_err(|_| unknown_pipeline(&id))?;

    let parameters = body.and_then(|Json(request)| request.parameters);
    let job_id = format!("{id}-{}", Uuid::new_v4());
    let job = worker
        .create_job(&job_id, parameters)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, error_body(e.to_string())))?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "jobId": job.id,
            "pipelineId": job.pipeline_id,
            "status": "queued",
            "timestamp": Utc::now(),
        })),
    ))
}
