//! Job scheduler.
//!
//! Owns the FIFO queue, the concurrency cap, the retry state machine, and
//! every lifecycle transition. All shared state lives behind one mutex that
//! is never held across a suspension point; handlers, store writes, git
//! subprocesses, and retry sleeps all run outside it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::kernel::classifier::classify;
use crate::kernel::failure::JobFailure;
use crate::kernel::git::GitWorkflowEngine;
use crate::kernel::telemetry::Telemetry;

use super::events::JobEvent;
use super::job::{Job, JobStatus};
use super::logs::JobLogWriter;
use super::store::JobStore;

/// Absolute ceiling on retries, regardless of configuration.
pub const RETRY_CIRCUIT_BREAKER: u32 = 5;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, TypedBuilder)]
pub struct SchedulerConfig {
    #[builder(setter(into))]
    pub pipeline_id: String,
    #[builder(default = 5)]
    pub max_concurrent: usize,
    #[builder(default = 5)]
    pub max_retries: u32,
    #[builder(default = true)]
    pub auto_start: bool,
}

/// Context handed to a handler for one attempt.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub pipeline_id: String,
    pub data: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: u32,
    cancelled: CancellationToken,
}

impl JobContext {
    /// Cooperative cancellation: handlers poll this between atomic steps.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Token for handlers that want to `select!` on cancellation or hand it
    /// to blocking work.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancelled.clone()
    }
}

/// User code invoked for a job. Opaque to the scheduler; expected idempotent.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, JobFailure>;
}

/// Adapt an async closure into a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<serde_json::Value, JobFailure>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait::async_trait]
    impl<F, Fut> JobHandler for FnHandler<F>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, JobFailure>> + Send + 'static,
    {
        async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, JobFailure> {
            (self.0)(ctx).await
        }
    }

    Arc::new(FnHandler(f))
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid job id {0:?}")]
    InvalidJobId(String),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {0} is already in a terminal state")]
    Terminal(String),
    #[error("job {0} is already paused")]
    AlreadyPaused(String),
    #[error("job {0} is not paused")]
    NotPaused(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerStats {
    pub total: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, Job>,
    queue: VecDeque<String>,
    active: usize,
    running: bool,
    cancel_tokens: HashMap<String, CancellationToken>,
    retry_timers: HashMap<String, JoinHandle<()>>,
}

pub struct JobScheduler {
    config: SchedulerConfig,
    store: Arc<JobStore>,
    handler: Arc<dyn JobHandler>,
    git: Option<Arc<GitWorkflowEngine>>,
    logs: Option<JobLogWriter>,
    telemetry: Telemetry,
    events: broadcast::Sender<JobEvent>,
    state: Mutex<SchedulerState>,
    weak_self: Weak<JobScheduler>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig, store: Arc<JobStore>, handler: Arc<dyn JobHandler>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            store,
            handler,
            git: None,
            logs: None,
            telemetry: Telemetry::default(),
            events,
            state: Mutex::new(SchedulerState::default()),
            weak_self: Weak::new(),
        }
    }

    /// Finalise construction. Dispatching spawns tasks that need a handle
    /// back to the scheduler, so it must live behind an `Arc`.
    pub fn shared(mut self) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            self.weak_self = weak.clone();
            self
        })
    }

    pub fn with_git(mut self, engine: Arc<GitWorkflowEngine>) -> Self {
        self.git = Some(engine);
        self
    }

    pub fn with_log_writer(mut self, logs: JobLogWriter) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn pipeline_id(&self) -> &str {
        &self.config.pipeline_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    fn effective_max_retries(&self) -> u32 {
        self.config.max_retries.min(RETRY_CIRCUIT_BREAKER)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begin dispatching. Awaits store readiness first; in-flight jobs from a
    /// previous `stop` are unaffected.
    pub async fn start(&self) {
        self.store.ready().await;
        {
            let mut state = self.lock_state();
            state.running = true;
        }
        info!(pipeline = %self.config.pipeline_id, "scheduler started");
        self.dispatch();
    }

    /// Stop dispatching new jobs. In-flight jobs run to completion.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        state.running = false;
    }

    /// Create a job, persist it, enqueue it, and kick the dispatch loop.
    ///
    /// A duplicate id overwrites history (upsert semantics, an explicit
    /// re-submission).
    pub async fn create_job(
        &self,
        id: &str,
        data: Option<serde_json::Value>,
    ) -> Result<Job, SchedulerError> {
        if !Job::is_valid_id(id) {
            return Err(SchedulerError::InvalidJobId(id.to_string()));
        }
        let job = Job::queued(id, &self.config.pipeline_id, data);
        {
            let mut state = self.lock_state();
            if let Some(timer) = state.retry_timers.remove(id) {
                timer.abort();
            }
            state.queue.retain(|queued| queued != id);
            state
                .cancel_tokens
                .insert(id.to_string(), CancellationToken::new());
            state.jobs.insert(id.to_string(), job.clone());
            state.queue.push_back(id.to_string());
        }
        self.persist(&job).await;
        self.emit(JobEvent::Created { job: job.clone() });
        self.dispatch();
        Ok(job)
    }

    /// Cancel a job. Queued jobs leave the queue immediately; running jobs
    /// are flagged and the handler may finish its current atomic step.
    pub async fn cancel_job(&self, id: &str) -> Result<Job, SchedulerError> {
        let snapshot = {
            let mut state = self.lock_state();
            let Some(job) = state.jobs.get_mut(id) else {
                return Err(SchedulerError::NotFound(id.to_string()));
            };
            if job.status.is_terminal() {
                return Err(SchedulerError::Terminal(id.to_string()));
            }
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            job.retry_pending = false;
            job.error = Some(JobFailure::cancelled("Job cancelled"));
            let snapshot = job.clone();

            state.queue.retain(|queued| queued != id);
            if let Some(timer) = state.retry_timers.remove(id) {
                timer.abort();
            }
            if let Some(token) = state.cancel_tokens.get(id) {
                token.cancel();
            }
            snapshot
        };
        self.persist(&snapshot).await;
        self.emit(JobEvent::Cancelled { job: snapshot.clone() });
        Ok(snapshot)
    }

    /// Pause a queued or running job.
    pub async fn pause_job(&self, id: &str) -> Result<Job, SchedulerError> {
        let snapshot = {
            let mut state = self.lock_state();
            let Some(job) = state.jobs.get_mut(id) else {
                return Err(SchedulerError::NotFound(id.to_string()));
            };
            if job.status.is_terminal() {
                return Err(SchedulerError::Terminal(id.to_string()));
            }
            if job.status == JobStatus::Paused {
                return Err(SchedulerError::AlreadyPaused(id.to_string()));
            }
            job.status = JobStatus::Paused;
            job.paused_at = Some(Utc::now());
            job.retry_pending = false;
            let snapshot = job.clone();

            state.queue.retain(|queued| queued != id);
            if let Some(timer) = state.retry_timers.remove(id) {
                timer.abort();
            }
            snapshot
        };
        self.persist(&snapshot).await;
        self.emit(JobEvent::Paused { job: snapshot.clone() });
        Ok(snapshot)
    }

    /// Re-enqueue a paused job.
    pub async fn resume_job(&self, id: &str) -> Result<Job, SchedulerError> {
        let snapshot = {
            let mut state = self.lock_state();
            let Some(job) = state.jobs.get_mut(id) else {
                return Err(SchedulerError::NotFound(id.to_string()));
            };
            if job.status != JobStatus::Paused {
                return Err(SchedulerError::NotPaused(id.to_string()));
            }
            job.status = JobStatus::Queued;
            job.resumed_at = Some(Utc::now());
            job.paused_at = None;
            let snapshot = job.clone();
            state.queue.push_back(id.to_string());
            snapshot
        };
        self.persist(&snapshot).await;
        self.emit(JobEvent::Resumed { job: snapshot.clone() });
        self.dispatch();
        Ok(snapshot)
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.lock_state().jobs.get(id).cloned()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock_state();
        let mut stats = SchedulerStats {
            total: state.jobs.len(),
            active: state.active,
            ..Default::default()
        };
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                _ => {}
            }
        }
        stats
    }

    /// Drain the queue into handler tasks while slots are free. Non-blocking;
    /// every launched task re-drives the loop as it finishes.
    fn dispatch(&self) {
        let Some(me) = self.weak_self.upgrade() else {
            warn!("dispatch on a scheduler that was never shared");
            return;
        };
        loop {
            let id = {
                let mut state = self.lock_state();
                if !state.running || state.active >= self.config.max_concurrent {
                    break;
                }
                match state.queue.pop_front() {
                    Some(id) => {
                        state.active += 1;
                        id
                    }
                    None => break,
                }
            };
            let scheduler = Arc::clone(&me);
            tokio::spawn(async move { scheduler.run_job(id).await });
        }
    }

    async fn run_job(self: Arc<Self>, id: String) {
        let prepared = {
            let mut state = self.lock_state();
            let token = state.cancel_tokens.entry(id.clone()).or_default().clone();
            match state.jobs.get_mut(&id) {
                Some(job) if job.status == JobStatus::Queued => {
                    job.status = JobStatus::Running;
                    job.started_at = Some(Utc::now());
                    job.completed_at = None;
                    job.retry_pending = false;
                    Some((job.clone(), token))
                }
                // Cancelled or paused between dequeue and start.
                _ => None,
            }
        };

        let Some((snapshot, cancel_token)) = prepared else {
            self.finish_slot();
            return;
        };

        self.persist(&snapshot).await;
        self.emit(JobEvent::Started { job: snapshot.clone() });

        // Optional git setup. A failure here is logged and swallowed; the
        // handler still runs, there just won't be a PR.
        let repo_path = snapshot
            .data
            .as_ref()
            .and_then(|d| d.get("repositoryPath"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let mut branch_ctx = None;
        if let (Some(engine), Some(repo)) = (self.git.as_ref(), repo_path.as_deref()) {
            match engine
                .prepare_branch(repo.as_ref(), &snapshot.pipeline_id, &snapshot.id)
                .await
            {
                Ok(ctx) => {
                    let mut state = self.lock_state();
                    if let Some(job) = state.jobs.get_mut(&id) {
                        job.git.branch_name = Some(ctx.branch.clone());
                        job.git.original_branch = Some(ctx.original_branch.clone());
                    }
                    branch_ctx = Some(ctx);
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "branch creation failed; running without git workflow");
                }
            }
        }

        let ctx = JobContext {
            job_id: id.clone(),
            pipeline_id: snapshot.pipeline_id.clone(),
            data: snapshot.data.clone().unwrap_or(serde_json::Value::Null),
            attempt: snapshot.retry_count + 1,
            cancelled: cancel_token,
        };
        let started = Instant::now();
        // The handler runs in its own task so a panic inside user code
        // surfaces as a failure instead of tearing down slot accounting.
        let handler = Arc::clone(&self.handler);
        let outcome = match tokio::spawn(async move { handler.run(ctx).await }).await {
            Ok(result) => result,
            Err(join_error) => Err(JobFailure::new(format!("handler panicked: {join_error}"))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                self.complete_job(&id, value, duration_ms, branch_ctx, repo_path.as_deref())
                    .await
            }
            Err(failure) => {
                self.fail_or_retry(&id, failure, branch_ctx, repo_path.as_deref())
                    .await
            }
        }

        self.finish_slot();
    }

    async fn complete_job(
        &self,
        id: &str,
        value: serde_json::Value,
        duration_ms: u64,
        branch_ctx: Option<crate::kernel::git::BranchContext>,
        repo_path: Option<&str>,
    ) {
        let proceed = {
            let mut state = self.lock_state();
            match state.jobs.get_mut(id) {
                Some(job) if job.status == JobStatus::Running => {
                    job.status = JobStatus::Completed;
                    job.completed_at = Some(Utc::now());
                    job.result = Some(value);
                    true
                }
                // Cancelled or paused while the handler ran; that transition
                // already persisted.
                _ => false,
            }
        };
        if !proceed {
            return;
        }

        // Git workflow errors downgrade metadata only; the job stays
        // completed.
        if let (Some(engine), Some(ctx), Some(repo)) =
            (self.git.as_ref(), branch_ctx.as_ref(), repo_path)
        {
            let pipeline_id = self.config.pipeline_id.clone();
            match engine.finish(repo.as_ref(), &pipeline_id, id, ctx).await {
                Ok(outcome) => {
                    let mut state = self.lock_state();
                    if let Some(job) = state.jobs.get_mut(id) {
                        job.git.changed_files = outcome.changed_files;
                        job.git.commit_sha = outcome.commit_sha;
                        job.git.pr_url = outcome.pr_url;
                    }
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "git workflow failed after a successful run");
                    self.telemetry.capture_failure("git", &e);
                }
            }
        }

        let Some(snapshot) = self.get_job(id) else {
            return;
        };
        self.persist(&snapshot).await;
        self.emit(JobEvent::Completed {
            job: snapshot.clone(),
            duration_ms,
        });
        if let Some(logs) = &self.logs {
            if let Err(e) = logs.write_success(&snapshot).await {
                warn!(job_id = %id, error = %e, "writing job log failed");
            }
        }
        debug!(job_id = %id, duration_ms, "job completed");
    }

    async fn fail_or_retry(
        &self,
        id: &str,
        failure: JobFailure,
        branch_ctx: Option<crate::kernel::git::BranchContext>,
        repo_path: Option<&str>,
    ) {
        let verdict = classify(&failure);
        let max_attempts = self.effective_max_retries();

        enum Next {
            Retry { snapshot: Job, attempt: u32 },
            Fail { snapshot: Job },
            Skip,
        }

        let next = {
            let mut state = self.lock_state();
            match state.jobs.get_mut(id) {
                Some(job) if job.status == JobStatus::Running => {
                    if verdict.retryable && job.retry_count < max_attempts {
                        job.retry_count += 1;
                        job.status = JobStatus::Queued;
                        job.started_at = None;
                        job.error = None;
                        job.retry_pending = true;
                        Next::Retry {
                            snapshot: job.clone(),
                            attempt: job.retry_count,
                        }
                    } else {
                        job.status = JobStatus::Failed;
                        job.completed_at = Some(Utc::now());
                        job.error = Some(failure.clone());
                        Next::Fail {
                            snapshot: job.clone(),
                        }
                    }
                }
                // Cancelled or paused while the handler ran.
                _ => Next::Skip,
            }
        };

        match next {
            Next::Retry { snapshot, attempt } => {
                info!(
                    job_id = %id,
                    attempt,
                    max_attempts,
                    delay_ms = verdict.delay.as_millis() as u64,
                    reason = %verdict.reason,
                    "scheduling retry"
                );
                self.emit(JobEvent::RetryScheduled {
                    job: snapshot.clone(),
                    attempt,
                    max_attempts,
                    reason: verdict.reason.clone(),
                    delay_ms: verdict.delay.as_millis() as u64,
                });
                self.persist(&snapshot).await;
                self.arm_retry_timer(id.to_string(), verdict.delay);
            }
            Next::Fail { snapshot } => {
                if let (Some(engine), Some(ctx), Some(repo)) =
                    (self.git.as_ref(), branch_ctx.as_ref(), repo_path)
                {
                    if let Err(e) = engine.cleanup(repo.as_ref(), ctx).await {
                        warn!(job_id = %id, error = %e, "branch cleanup failed");
                    }
                }
                self.emit(JobEvent::Failed {
                    job: snapshot.clone(),
                });
                self.persist(&snapshot).await;
                self.telemetry.capture_failure("handler", &failure);
                if let Some(logs) = &self.logs {
                    if let Err(e) = logs.write_failure(&snapshot).await {
                        warn!(job_id = %id, error = %e, "writing job error log failed");
                    }
                }
            }
            Next::Skip => {}
        }
    }

    fn arm_retry_timer(&self, id: String, delay: Duration) {
        let Some(scheduler) = self.weak_self.upgrade() else {
            return;
        };
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.fire_retry(&timer_id);
        });
        let mut state = self.lock_state();
        if let Some(previous) = state.retry_timers.insert(id, handle) {
            previous.abort();
        }
    }

    fn fire_retry(&self, id: &str) {
        {
            let mut state = self.lock_state();
            state.retry_timers.remove(id);
            let Some(job) = state.jobs.get_mut(id) else {
                // Job vanished; nothing to do.
                return;
            };
            if !job.retry_pending {
                return;
            }
            if job.status != JobStatus::Queued {
                job.retry_pending = false;
                return;
            }
            job.retry_pending = false;
            state.queue.push_back(id.to_string());
        }
        self.dispatch();
    }

    fn finish_slot(&self) {
        {
            let mut state = self.lock_state();
            state.active = state.active.saturating_sub(1);
        }
        self.dispatch();
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.store.save(job).await {
            // A store failure must not reach the handler; log and move on.
            warn!(job_id = %job.id, error = %e, "persisting job state failed");
            self.telemetry
                .capture_failure("store", &JobFailure::new(e.to_string()));
        }
    }

    fn emit(&self, event: JobEvent) {
        // Send only fails when nobody subscribed, which is fine.
        let _ = self.events.send(event);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> Arc<JobStore> {
        let store = JobStore::new(dir.path().join("jobs.db"));
        store.init().await.unwrap();
        store
    }

    fn config(pipeline: &str, max_concurrent: usize) -> SchedulerConfig {
        SchedulerConfig::builder()
            .pipeline_id(pipeline)
            .max_concurrent(max_concurrent)
            .build()
    }

    async fn started_scheduler(
        store: Arc<JobStore>,
        cfg: SchedulerConfig,
        handler: Arc<dyn JobHandler>,
    ) -> Arc<JobScheduler> {
        let scheduler = JobScheduler::new(cfg, store, handler).shared();
        scheduler.start().await;
        scheduler
    }

    async fn wait_for_terminal(scheduler: &Arc<JobScheduler>, id: &str) -> Job {
        for _ in 0..600 {
            if let Some(job) = scheduler.get_job(id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_retries_then_succeeds() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_handler = Arc::clone(&attempts);
        let handler = handler_fn(move |_ctx| {
            let attempts = Arc::clone(&attempts_in_handler);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(JobFailure::new("Temporary failure").with_code("ETIMEDOUT"))
                } else {
                    Ok(serde_json::json!({"success": true}))
                }
            }
        });
        let scheduler = started_scheduler(store, config("test", 1), handler).await;

        let mut events = scheduler.subscribe();
        scheduler.create_job("test-job-7", None).await.unwrap();
        let job = wait_for_terminal(&scheduler, "test-job-7").await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.result, Some(serde_json::json!({"success": true})));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let mut retries = 0;
        while let Ok(event) = events.try_recv() {
            if let JobEvent::RetryScheduled {
                attempt,
                max_attempts,
                ..
            } = event
            {
                retries += 1;
                assert_eq!(attempt, 1);
                assert_eq!(max_attempts, 5);
            }
        }
        assert_eq!(retries, 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_fails_immediately() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_handler = Arc::clone(&attempts);
        let handler = handler_fn(move |_ctx| {
            let attempts = Arc::clone(&attempts_in_handler);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(JobFailure::new("validation failed"))
            }
        });
        let scheduler = started_scheduler(store, config("test", 1), handler).await;

        scheduler.create_job("bad-job", None).await.unwrap();
        let job = wait_for_terminal(&scheduler, "bad-job").await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.error.as_ref().unwrap().message, "validation failed");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_ceiling_forces_failure() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_handler = Arc::clone(&attempts);
        let handler = handler_fn(move |_ctx| {
            let attempts = Arc::clone(&attempts_in_handler);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(JobFailure::new("still down").with_code("ECONNRESET"))
            }
        });
        let cfg = SchedulerConfig::builder()
            .pipeline_id("test")
            .max_concurrent(1)
            .max_retries(2)
            .build();
        let scheduler = started_scheduler(store, cfg, handler).await;

        scheduler.create_job("doomed", None).await.unwrap();
        let job = wait_for_terminal(&scheduler, "doomed").await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        // max_retries + 1 handler invocations in total.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn config_ceiling_is_clamped_by_circuit_breaker() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let cfg = SchedulerConfig::builder()
            .pipeline_id("test")
            .max_retries(50)
            .build();
        let scheduler = JobScheduler::new(
            cfg,
            store,
            handler_fn(|_| async { Ok(serde_json::Value::Null) }),
        )
        .shared();
        assert_eq!(scheduler.effective_max_retries(), RETRY_CIRCUIT_BREAKER);
    }

    #[tokio::test]
    async fn cancel_queued_job_never_dispatches_it() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let ran: Arc<Mutex<Vec<String>>> = Arc::default();
        let ran_in_handler = Arc::clone(&ran);
        let handler = handler_fn(move |ctx| {
            let ran = Arc::clone(&ran_in_handler);
            async move {
                ran.lock().unwrap().push(ctx.job_id.clone());
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(serde_json::Value::Null)
            }
        });
        let scheduler = started_scheduler(store, config("test", 1), handler).await;

        scheduler.create_job("job-a", None).await.unwrap();
        scheduler.create_job("job-b", None).await.unwrap();
        // While A runs, cancel queued B.
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.cancel_job("job-b").await.unwrap();

        let a = wait_for_terminal(&scheduler, "job-a").await;
        assert_eq!(a.status, JobStatus::Completed);

        let b = scheduler.get_job("job-b").unwrap();
        assert_eq!(b.status, JobStatus::Cancelled);
        assert!(b.error.as_ref().unwrap().cancelled);

        // B never entered the handler.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*ran.lock().unwrap(), ["job-a"]);

        let stats = scheduler.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn cancelling_terminal_job_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let handler = handler_fn(|_| async { Ok(serde_json::Value::Null) });
        let scheduler = started_scheduler(store, config("test", 1), handler).await;

        scheduler.create_job("done", None).await.unwrap();
        wait_for_terminal(&scheduler, "done").await;
        assert!(matches!(
            scheduler.cancel_job("done").await,
            Err(SchedulerError::Terminal(_))
        ));
        assert!(matches!(
            scheduler.cancel_job("missing").await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fifo_dispatch_with_single_slot() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let order: Arc<Mutex<Vec<String>>> = Arc::default();
        let order_in_handler = Arc::clone(&order);
        let handler = handler_fn(move |ctx| {
            let order = Arc::clone(&order_in_handler);
            async move {
                order.lock().unwrap().push(ctx.job_id.clone());
                Ok(serde_json::Value::Null)
            }
        });
        let scheduler = started_scheduler(store, config("test", 1), handler).await;

        for i in 0..4 {
            scheduler
                .create_job(&format!("job-{i}"), None)
                .await
                .unwrap();
        }
        for i in 0..4 {
            wait_for_terminal(&scheduler, &format!("job-{i}")).await;
        }
        assert_eq!(*order.lock().unwrap(), ["job-0", "job-1", "job-2", "job-3"]);
    }

    #[tokio::test]
    async fn concurrency_cap_is_never_exceeded() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let live = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (live_h, peak_h) = (Arc::clone(&live), Arc::clone(&peak));
        let handler = handler_fn(move |_ctx| {
            let live = Arc::clone(&live_h);
            let peak = Arc::clone(&peak_h);
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        });
        let scheduler = started_scheduler(store, config("test", 3), handler).await;

        for i in 0..10 {
            scheduler
                .create_job(&format!("job-{i}"), None)
                .await
                .unwrap();
        }
        for i in 0..10 {
            wait_for_terminal(&scheduler, &format!("job-{i}")).await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let handler = handler_fn(|_| async { Ok(serde_json::Value::Null) });
        let scheduler = JobScheduler::new(config("test", 1), store, handler).shared();
        // Not started: jobs stay queued so we can pause deterministically.
        scheduler.create_job("job-p", None).await.unwrap();

        let paused = scheduler.pause_job("job-p").await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert!(paused.paused_at.is_some());
        assert!(matches!(
            scheduler.pause_job("job-p").await,
            Err(SchedulerError::AlreadyPaused(_))
        ));

        let resumed = scheduler.resume_job("job-p").await.unwrap();
        assert_eq!(resumed.status, JobStatus::Queued);
        assert!(resumed.paused_at.is_none());
        assert!(resumed.resumed_at.is_some());

        scheduler.start().await;
        let job = wait_for_terminal(&scheduler, "job-p").await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn stopped_scheduler_does_not_dispatch() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let ran = Arc::new(AtomicU32::new(0));
        let ran_h = Arc::clone(&ran);
        let handler = handler_fn(move |_ctx| {
            let ran = Arc::clone(&ran_h);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        });
        let scheduler = JobScheduler::new(config("test", 1), store, handler).shared();

        scheduler.create_job("held", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.get_job("held").unwrap().status, JobStatus::Queued);

        scheduler.start().await;
        wait_for_terminal(&scheduler, "held").await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_timer_aborts_when_job_cancelled() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_h = Arc::clone(&attempts);
        let handler = handler_fn(move |_ctx| {
            let attempts = Arc::clone(&attempts_h);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(JobFailure::new("flaky").with_code("ETIMEDOUT"))
            }
        });
        let scheduler = started_scheduler(store, config("test", 1), handler).await;

        scheduler.create_job("flaky-job", None).await.unwrap();
        // Wait until the first failure armed a retry.
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if attempts.load(Ordering::SeqCst) >= 1 {
                break;
            }
        }
        scheduler.cancel_job("flaky-job").await.unwrap();

        // Let any armed timer elapse; the handler must not run again.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(
            scheduler.get_job("flaky-job").unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn invalid_job_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let handler = handler_fn(|_| async { Ok(serde_json::Value::Null) });
        let scheduler = JobScheduler::new(config("test", 1), store, handler).shared();
        assert!(matches!(
            scheduler.create_job("../etc", None).await,
            Err(SchedulerError::InvalidJobId(_))
        ));
    }

    #[tokio::test]
    async fn handler_panic_fails_the_job_and_frees_the_slot() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let handler = handler_fn(|ctx| async move {
            if ctx.job_id == "panics" {
                panic!("handler exploded");
            }
            Ok(serde_json::Value::Null)
        });
        let scheduler = started_scheduler(store, config("test", 1), handler).await;

        scheduler.create_job("panics", None).await.unwrap();
        scheduler.create_job("fine", None).await.unwrap();

        let crashed = wait_for_terminal(&scheduler, "panics").await;
        assert_eq!(crashed.status, JobStatus::Failed);
        assert!(crashed.error.unwrap().message.contains("panicked"));

        // The crash did not corrupt the other job or wedge the slot.
        let fine = wait_for_terminal(&scheduler, "fine").await;
        assert_eq!(fine.status, JobStatus::Completed);
    }
}
