//! Aggregate server status for the dashboard.

use axum::{extract::Extension, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::kernel::jobs::{StoreHealth, SUPPORTED_PIPELINES};
use crate::server::app::AppState;

#[derive(Serialize)]
pub struct StatusResponse {
    pub timestamp: DateTime<Utc>,
    pub pipelines: Vec<PipelineStatus>,
    pub queue: QueueStatus,
    pub store: StoreHealth,
}

#[derive(Serialize)]
pub struct PipelineStatus {
    pub id: String,
    pub name: String,
    /// `running` while the pipeline has active jobs, `idle` otherwise.
    pub status: String,
    #[serde(rename = "completedJobs")]
    pub completed_jobs: i64,
    #[serde(rename = "failedJobs")]
    pub failed_jobs: i64,
}

#[derive(Serialize, Default)]
pub struct QueueStatus {
    pub active: usize,
    pub queued: usize,
}

fn display_name(id: &str) -> String {
    id.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub async fn status_handler(Extension(state): Extension<AppState>) -> Json<StatusResponse> {
    let worker_stats = state.registry.stats().await;
    let mut queue = QueueStatus::default();
    for stats in worker_stats.values() {
        queue.active += stats.active;
        queue.queued += stats.queued;
    }

    let mut pipelines = Vec::with_capacity(SUPPORTED_PIPELINES.len());
    for id in SUPPORTED_PIPELINES {
        let counts = state.store.counts(id).await.unwrap_or_default();
        let running = worker_stats.get(*id).map(|s| s.active > 0).unwrap_or(false);
        pipelines.push(PipelineStatus {
            id: id.to_string(),
            name: display_name(id),
            status: if running { "running" } else { "idle" }.to_string(),
            completed_jobs: counts.completed,
            failed_jobs: counts.failed,
        });
    }

    Json(StatusResponse {
        timestamp: Utc::now(),
        pipelines,
        queue,
        store: state.store.health(),
    })
}
