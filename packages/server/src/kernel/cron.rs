//! Cron driver for scheduled job submission.
//!
//! Registrations use standard 5-field crontab expressions; the underlying
//! scheduler wants a seconds field, so expressions are normalised before
//! registration. Callbacks refuse to submit when their worker is stopped,
//! and missed ticks are never backfilled.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler as CronScheduler};
use tracing::{error, info, warn};

use super::jobs::{Job, WorkerRegistry};

pub struct CronDriver {
    scheduler: CronScheduler,
}

impl CronDriver {
    pub async fn new() -> Result<Self> {
        let scheduler = CronScheduler::new()
            .await
            .context("creating cron scheduler")?;
        Ok(Self { scheduler })
    }

    /// Register a callback on a 5-field crontab schedule.
    pub async fn add_schedule<F, Fut>(&self, schedule: &str, callback: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let normalized = normalize_schedule(schedule)?;
        let job = CronJob::new_async(normalized.as_str(), move |_uuid, _lock| {
            let callback = callback.clone();
            Box::pin(async move { callback().await })
        })
        .with_context(|| format!("registering cron schedule {schedule:?}"))?;
        self.scheduler.add(job).await.context("adding cron job")?;
        info!(schedule, "cron schedule registered");
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await.context("starting cron driver")?;
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .context("shutting down cron driver")?;
        Ok(())
    }
}

/// Accept a standard 5-field crontab; the backing scheduler needs a seconds
/// field, so one is prepended. 6/7-field expressions pass through.
pub fn normalize_schedule(expr: &str) -> Result<String> {
    match expr.split_whitespace().count() {
        5 => Ok(format!("0 {expr}")),
        6 | 7 => Ok(expr.to_string()),
        n => bail!("invalid cron expression {expr:?}: expected 5 fields, found {n}"),
    }
}

/// The principal sweep: submit one duplicate-detection job per repository
/// directory under `repos_root`. Skips entirely while the worker is stopped.
pub async fn run_repo_sweep(registry: &WorkerRegistry, repos_root: &PathBuf) {
    let worker = match registry.get_worker("duplicate-detection").await {
        Ok(worker) => worker,
        Err(e) => {
            error!(error = %e, "repo sweep could not resolve its worker");
            return;
        }
    };
    if !worker.is_running() {
        warn!("scheduler is stopped; skipping cron sweep");
        return;
    }

    let mut entries = match tokio::fs::read_dir(repos_root).await {
        Ok(entries) => entries,
        Err(e) => {
            error!(root = %repos_root.display(), error = %e, "reading repos root failed");
            return;
        }
    };

    let stamp = chrono::Utc::now().timestamp();
    let mut submitted = 0usize;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = Job::sanitized_id(&entry.file_name().to_string_lossy());
        if name.is_empty() {
            continue;
        }
        let job_id = format!("sweep-{name}-{stamp}");
        let data = serde_json::json!({"repositoryPath": path.to_string_lossy()});
        match worker.create_job(&job_id, Some(data)).await {
            Ok(_) => submitted += 1,
            Err(e) => warn!(job_id, error = %e, "sweep job submission failed"),
        }
    }
    info!(submitted, "repo sweep submitted");
}

/// Wire the principal sweep onto the driver, with an optional immediate run.
pub async fn register_repo_sweep(
    driver: &CronDriver,
    registry: Arc<WorkerRegistry>,
    repos_root: PathBuf,
    schedule: &str,
    run_on_startup: bool,
) -> Result<()> {
    let sweep_registry = Arc::clone(&registry);
    let sweep_root = repos_root.clone();
    driver
        .add_schedule(schedule, move || {
            let registry = Arc::clone(&sweep_registry);
            let root = sweep_root.clone();
            async move { run_repo_sweep(&registry, &root).await }
        })
        .await?;

    if run_on_startup {
        run_repo_sweep(&registry, &repos_root).await;
    }
    Ok(())
}
