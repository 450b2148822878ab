//! Worker registry: one lazily-built scheduler per supported pipeline.
//!
//! The registry is constructed once at boot and passed by reference; the
//! same pipeline id always resolves to the same scheduler instance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::kernel::activity::ActivityStream;
use crate::kernel::git::{GitWorkflowConfig, GitWorkflowEngine};
use crate::kernel::telemetry::Telemetry;

use super::handlers;
use super::logs::JobLogWriter;
use super::scheduler::{JobScheduler, SchedulerConfig, SchedulerStats};
use super::store::JobStore;

pub const SUPPORTED_PIPELINES: &[&str] = &[
    "duplicate-detection",
    "gitignore-update",
    "readme-enhancement",
    "repomix-pack",
];

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown pipeline {id:?}; supported pipelines: {supported}")]
    UnsupportedPipeline { id: String, supported: String },
}

impl RegistryError {
    fn unsupported(id: &str) -> Self {
        Self::UnsupportedPipeline {
            id: id.to_string(),
            supported: SUPPORTED_PIPELINES.join(", "),
        }
    }
}

/// Per-worker defaults applied when a scheduler is first built.
#[derive(Debug, Clone)]
pub struct WorkerDefaults {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub auto_start: bool,
    pub git: Option<GitWorkflowConfig>,
    pub log_dir: Option<PathBuf>,
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_retries: 5,
            auto_start: true,
            git: None,
            log_dir: None,
        }
    }
}

pub struct WorkerRegistry {
    store: Arc<JobStore>,
    activity: Arc<ActivityStream>,
    telemetry: Telemetry,
    defaults: WorkerDefaults,
    workers: Mutex<HashMap<String, Arc<JobScheduler>>>,
}

impl WorkerRegistry {
    pub fn new(
        store: Arc<JobStore>,
        activity: Arc<ActivityStream>,
        defaults: WorkerDefaults,
    ) -> Self {
        Self {
            store,
            activity,
            telemetry: Telemetry::default(),
            defaults,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn is_supported(id: &str) -> bool {
        SUPPORTED_PIPELINES.contains(&id)
    }

    pub fn supported() -> &'static [&'static str] {
        SUPPORTED_PIPELINES
    }

    /// Resolve (building on first use) the scheduler for a pipeline.
    pub async fn get_worker(&self, id: &str) -> Result<Arc<JobScheduler>, RegistryError> {
        if !Self::is_supported(id) {
            return Err(RegistryError::unsupported(id));
        }
        let handler = handlers::builtin(id).ok_or_else(|| RegistryError::unsupported(id))?;

        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.get(id) {
            return Ok(Arc::clone(existing));
        }

        let config = SchedulerConfig::builder()
            .pipeline_id(id)
            .max_concurrent(self.defaults.max_concurrent)
            .max_retries(self.defaults.max_retries)
            .auto_start(self.defaults.auto_start)
            .build();
        let mut scheduler =
            JobScheduler::new(config, Arc::clone(&self.store), handler)
                .with_telemetry(self.telemetry.clone());
        if let Some(git) = &self.defaults.git {
            scheduler = scheduler.with_git(Arc::new(GitWorkflowEngine::new(git.clone())));
        }
        if let Some(log_dir) = &self.defaults.log_dir {
            scheduler = scheduler.with_log_writer(JobLogWriter::new(log_dir.join(id)));
        }
        let scheduler = scheduler.shared();

        Arc::clone(&self.activity).listen_to_worker(&scheduler);
        if self.defaults.auto_start {
            scheduler.start().await;
        }
        info!(pipeline = id, "worker initialised");

        workers.insert(id.to_string(), Arc::clone(&scheduler));
        Ok(scheduler)
    }

    /// Stats for every instantiated worker.
    pub async fn stats(&self) -> HashMap<String, SchedulerStats> {
        let workers = self.workers.lock().await;
        workers
            .iter()
            .map(|(id, worker)| (id.clone(), worker.stats()))
            .collect()
    }

    /// Stop all workers and wait for in-flight jobs to drain.
    pub async fn shutdown(&self) {
        let workers: Vec<Arc<JobScheduler>> = {
            let guard = self.workers.lock().await;
            guard.values().cloned().collect()
        };
        for worker in &workers {
            worker.stop();
        }

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            let active: usize = workers.iter().map(|w| w.stats().active).sum();
            if active == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                info!(active, "shutdown drain timed out with jobs still active");
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        info!("worker registry shut down");
    }
}
