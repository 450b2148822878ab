//! Application setup and router wiring.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::activity::{ActivityStream, DEFAULT_CAPACITY};
use crate::kernel::config::Config;
use crate::kernel::git::GitWorkflowConfig;
use crate::kernel::jobs::{JobStore, WorkerDefaults, WorkerRegistry};
use crate::server::routes::{
    activity_ws_handler, health_handler, list_pipeline_jobs, start_scan, status_handler,
    trigger_pipeline,
};

/// Shared application state. Constructed once at boot and passed by
/// reference; nothing here is a process-wide singleton.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<JobStore>,
    pub registry: Arc<WorkerRegistry>,
    pub activity: Arc<ActivityStream>,
}

fn worker_defaults(config: &Config) -> WorkerDefaults {
    WorkerDefaults {
        max_concurrent: config.max_concurrent,
        max_retries: 5,
        auto_start: true,
        git: config.git.enabled.then(|| {
            GitWorkflowConfig::builder()
                .base_branch(config.git.base_branch.clone())
                .branch_prefix(config.git.branch_prefix.clone())
                .dry_run(config.git.dry_run)
                .build()
        }),
        log_dir: Some(config.log_dir.clone()),
    }
}

/// Initialise the store, the registry, and the activity stream, and build
/// the router around them.
pub async fn build_app(config: Config) -> Result<(Router, AppState)> {
    let store = JobStore::new(&config.db_path);
    store.init().await?;

    let activity = Arc::new(ActivityStream::new(DEFAULT_CAPACITY));
    let registry = Arc::new(WorkerRegistry::new(
        Arc::clone(&store),
        Arc::clone(&activity),
        worker_defaults(&config),
    ));

    let state = AppState {
        config: Arc::new(config),
        store,
        registry,
        activity,
    };

    Ok((build_router(state.clone()), state))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route(
            "/api/sidequest/pipeline-runners/:id/jobs",
            get(list_pipeline_jobs),
        )
        .route(
            "/api/sidequest/pipeline-runners/:id/trigger",
            post(trigger_pipeline),
        )
        .route("/api/scans/start", post(start_scan))
        .route("/ws/activity", get(activity_ws_handler))
        .layer(Extension(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
