//! Repository scan submission.

use axum::{extract::Extension, http::StatusCode, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::server::app::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct StartScanRequest {
    #[serde(rename = "repositoryPath")]
    pub repository_path: Option<String>,
}

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "message": message,
            "timestamp": Utc::now(),
        })),
    )
}

/// POST /api/scans/start
pub async fn start_scan(
    Extension(state): Extension<AppState>,
    body: Option<Json<StartScanRequest>>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let repository_path = body
        .and_then(|Json(request)| request.repository_path)
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| bad_request("repositoryPath must be a non-empty string"))?;

    let worker = state
        .registry
        .get_worker("duplicate-detection")
        .await
        .map_err(|e| bad_request(&e.to_string()))?;

    let scan_id = format!("scan-{}", Uuid::new_v4());
    let data = json!({"repositoryPath": repository_path});
    worker
        .create_job(&scan_id, Some(data))
        .await
        .map_err(|e| bad_request(&e.to_string()))?;

    Ok((StatusCode::CREATED, Json(json!({"scanId": scan_id}))))
}
