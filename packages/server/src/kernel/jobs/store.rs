//! Durable job store.
//!
//! A SQLite file (WAL journal, 5 s busy timeout) holds the `jobs` table; an
//! in-memory mirror of every row backs reads when the disk misbehaves. Disk
//! trouble never loses a write: after five consecutive persist failures the
//! store enters degraded mode, queues write markers in a bounded queue, and a
//! recovery worker re-serialises the full in-memory image once the disk
//! returns.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::{watch, Notify, OnceCell};
use tracing::{error, info, warn};

use crate::kernel::failure::JobFailure;

use super::job::{GitInfo, Job, JobStatus};

pub const MAX_PERSIST_FAILURES: u32 = 5;
pub const MAX_QUEUED_WRITES: usize = 10_000;
pub const MAX_RECOVERY_ATTEMPTS: u32 = 10;
const RECOVERY_BASE_DELAY: Duration = Duration::from_secs(5);
const RECOVERY_MAX_DELAY: Duration = Duration::from_secs(300);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MEMORY_PRESSURE_BYTES: u64 = 50 * 1024 * 1024;

const CREATE_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    pipeline_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    data TEXT,
    result TEXT,
    error TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    git TEXT
)";

const CREATE_INDEX_SQL: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_jobs_pipeline ON jobs (pipeline_id)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs (created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_pipeline_status ON jobs (pipeline_id, status)",
];

const SAVE_SQL: &str = "\
INSERT OR REPLACE INTO jobs \
(id, pipeline_id, status, created_at, started_at, completed_at, data, result, error, retry_count, git) \
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

const IMPORT_SQL: &str = "\
INSERT OR IGNORE INTO jobs \
(id, pipeline_id, status, created_at, started_at, completed_at, data, result, error, retry_count, git) \
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

/// Marker for a write that reached memory but not yet the disk.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedWrite {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct DurabilityState {
    degraded: bool,
    persist_failures: u32,
    recovery_attempts: u32,
    recovery_exhausted: bool,
    write_queue: VecDeque<QueuedWrite>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusCounts {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub paused: i64,
    pub total: i64,
}

impl StatusCounts {
    fn bump(&mut self, status: JobStatus, by: i64) {
        match status {
            JobStatus::Queued => self.queued += by,
            JobStatus::Running => self.running += by,
            JobStatus::Completed => self.completed += by,
            JobStatus::Failed => self.failed += by,
            JobStatus::Cancelled => self.cancelled += by,
            JobStatus::Paused => self.paused += by,
        }
        self.total += by;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub pipeline_id: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub last_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub status: Option<JobStatus>,
    /// Coarse filter: `failed` (failed + cancelled), `active`, `completed`.
    pub tab: Option<String>,
    pub limit: i64,
    pub offset: i64,
    pub include_total: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            status: None,
            tab: None,
            limit: 50,
            offset: 0,
            include_total: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub status: String,
    pub db_path: String,
    pub db_size_bytes: u64,
    pub queued_writes: usize,
    pub queue_staleness_ms: Option<i64>,
    pub memory_pressure: String,
    pub persist_failure_count: u32,
    pub recovery_attempts: u32,
    pub message: String,
}

pub struct JobStore {
    db_path: PathBuf,
    pool: OnceCell<SqlitePool>,
    mem: RwLock<HashMap<String, Job>>,
    durability: Mutex<DurabilityState>,
    ready_tx: watch::Sender<bool>,
    recovery_kick: Notify,
    weak_self: Weak<JobStore>,
    #[cfg(test)]
    injected_persist_failures: std::sync::atomic::AtomicU32,
}

impl JobStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        let db_path = db_path.into();
        Arc::new_cyclic(|weak| Self {
            db_path,
            pool: OnceCell::new(),
            mem: RwLock::new(HashMap::new()),
            durability: Mutex::new(DurabilityState::default()),
            ready_tx,
            recovery_kick: Notify::new(),
            weak_self: weak.clone(),
            #[cfg(test)]
            injected_persist_failures: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Open the database, create schema, load the in-memory mirror, and
    /// start the recovery worker.
    pub async fn init(&self) -> Result<()> {
        if let Some(dir) = self.db_path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("creating store directory {}", dir.display()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening job store at {}", self.db_path.display()))?;

        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;
        for index in CREATE_INDEX_SQL {
            sqlx::query(index).execute(&pool).await?;
        }

        let rows = sqlx::query("SELECT * FROM jobs").fetch_all(&pool).await?;
        {
            let mut mem = self.mem.write().unwrap_or_else(|e| e.into_inner());
            for row in &rows {
                match row_to_job(row) {
                    Ok(job) => {
                        mem.insert(job.id.clone(), job);
                    }
                    Err(e) => warn!(error = %e, "skipping unreadable job row"),
                }
            }
        }

        self.pool
            .set(pool)
            .map_err(|_| anyhow!("job store is already initialized"))?;

        if let Some(store) = self.weak_self.upgrade() {
            tokio::spawn(async move { store.recovery_worker().await });
        }

        self.ready_tx.send_replace(true);
        info!(db_path = %self.db_path.display(), jobs = rows.len(), "job store ready");
        Ok(())
    }

    /// Resolve once `init` has completed.
    pub async fn ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.pool.get().is_some()
    }

    pub fn is_degraded(&self) -> bool {
        self.durability
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .degraded
    }

    /// Upsert a job. Never silently drops data: a disk failure leaves the
    /// write in memory and feeds degraded-mode accounting; only a buggy
    /// caller (invalid id) gets an error.
    pub async fn save(&self, job: &Job) -> Result<()> {
        if !Job::is_valid_id(&job.id) {
            bail!("invalid job id {:?}", job.id);
        }

        {
            let mut mem = self.mem.write().unwrap_or_else(|e| e.into_inner());
            mem.insert(job.id.clone(), job.clone());
        }

        if self.is_degraded() {
            self.enqueue_write(&job.id);
            return Ok(());
        }

        let Some(pool) = self.pool.get() else {
            bail!("job store is not initialized");
        };

        match self.persist_job(pool, job).await {
            Ok(()) => {
                let mut dur = self.durability.lock().unwrap_or_else(|e| e.into_inner());
                dur.persist_failures = 0;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "persisting job failed; keeping write in memory");
                self.note_persist_failure(&job.id);
            }
        }
        Ok(())
    }

    async fn persist_job(&self, pool: &SqlitePool, job: &Job) -> Result<()> {
        #[cfg(test)]
        {
            if self.take_injected_fault() {
                bail!("injected persist failure");
            }
        }
        save_query(SAVE_SQL, job).execute(pool).await?;
        Ok(())
    }

    fn note_persist_failure(&self, id: &str) {
        let tripped = {
            let mut dur = self.durability.lock().unwrap_or_else(|e| e.into_inner());
            dur.persist_failures += 1;
            push_write(&mut dur.write_queue, id);
            if dur.persist_failures >= MAX_PERSIST_FAILURES && !dur.degraded {
                dur.degraded = true;
                dur.recovery_attempts = 0;
                dur.recovery_exhausted = false;
                true
            } else {
                false
            }
        };
        if tripped {
            error!(
                threshold = MAX_PERSIST_FAILURES,
                "job store entering degraded mode; writes stay in memory"
            );
            self.recovery_kick.notify_one();
        }
    }

    fn enqueue_write(&self, id: &str) {
        let mut dur = self.durability.lock().unwrap_or_else(|e| e.into_inner());
        push_write(&mut dur.write_queue, id);
    }

    async fn recovery_worker(self: Arc<Self>) {
        loop {
            self.recovery_kick.notified().await;
            let mut attempt: u32 = 0;
            loop {
                if !self.is_degraded() {
                    break;
                }
                if attempt >= MAX_RECOVERY_ATTEMPTS {
                    {
                        let mut dur = self.durability.lock().unwrap_or_else(|e| e.into_inner());
                        dur.recovery_exhausted = true;
                    }
                    error!("store recovery attempts exhausted; staying degraded");
                    break;
                }
                tokio::time::sleep(recovery_delay(attempt)).await;
                attempt += 1;
                {
                    let mut dur = self.durability.lock().unwrap_or_else(|e| e.into_inner());
                    dur.recovery_attempts = attempt;
                }
                match self.flush_memory_image().await {
                    Ok(count) => {
                        let mut dur = self.durability.lock().unwrap_or_else(|e| e.into_inner());
                        dur.degraded = false;
                        dur.persist_failures = 0;
                        dur.write_queue.clear();
                        drop(dur);
                        info!(jobs = count, attempt, "job store recovered");
                        break;
                    }
                    Err(e) => warn!(attempt, error = %e, "store recovery attempt failed"),
                }
            }
        }
    }

    /// Rewrite every in-memory job to disk in one transaction.
    async fn flush_memory_image(&self) -> Result<usize> {
        #[cfg(test)]
        {
            if self.take_injected_fault() {
                bail!("injected persist failure");
            }
        }
        let Some(pool) = self.pool.get() else {
            bail!("job store is not initialized");
        };
        let snapshot: Vec<Job> = {
            let mem = self.mem.read().unwrap_or_else(|e| e.into_inner());
            mem.values().cloned().collect()
        };
        let mut tx = pool.begin().await?;
        for job in &snapshot {
            save_query(SAVE_SQL, job).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(snapshot.len())
    }

    /// Exact lookup from the in-memory mirror.
    pub fn get_by_id(&self, id: &str) -> Option<Job> {
        self.mem
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub async fn list(&self, pipeline_id: &str, opts: &ListOptions) -> Result<JobPage> {
        self.list_inner(Some(pipeline_id), opts).await
    }

    pub async fn list_all(&self, opts: &ListOptions) -> Result<JobPage> {
        self.list_inner(None, opts).await
    }

    async fn list_inner(&self, pipeline_id: Option<&str>, opts: &ListOptions) -> Result<JobPage> {
        let statuses = status_filter(opts);
        if self.is_degraded() || !self.is_initialized() {
            return Ok(self.list_from_memory(pipeline_id, &statuses, opts));
        }
        match self.list_from_sql(pipeline_id, &statuses, opts).await {
            Ok(page) => Ok(page),
            Err(e) => {
                warn!(error = %e, "listing from disk failed; serving from memory");
                Ok(self.list_from_memory(pipeline_id, &statuses, opts))
            }
        }
    }

    async fn list_from_sql(
        &self,
        pipeline_id: Option<&str>,
        statuses: &[JobStatus],
        opts: &ListOptions,
    ) -> Result<JobPage> {
        let pool = self.pool.get().ok_or_else(|| anyhow!("not initialized"))?;
        let where_clause = build_where(pipeline_id.is_some(), statuses);

        let select = format!(
            "SELECT * FROM jobs {where_clause} ORDER BY created_at DESC LIMIT ? OFFSET ?"
        );
        let mut query = sqlx::query(&select);
        if let Some(pipeline) = pipeline_id {
            query = query.bind(pipeline.to_string());
        }
        query = query.bind(opts.limit).bind(opts.offset);
        let rows = query.fetch_all(pool).await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_job(row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(error = %e, "skipping unreadable job row"),
            }
        }

        let total = if opts.include_total {
            let count_sql = format!("SELECT COUNT(*) AS n FROM jobs {where_clause}");
            let mut count_query = sqlx::query(&count_sql);
            if let Some(pipeline) = pipeline_id {
                count_query = count_query.bind(pipeline.to_string());
            }
            let row = count_query.fetch_one(pool).await?;
            Some(row.try_get::<i64, _>("n")?)
        } else {
            None
        };

        Ok(JobPage { jobs, total })
    }

    fn list_from_memory(
        &self,
        pipeline_id: Option<&str>,
        statuses: &[JobStatus],
        opts: &ListOptions,
    ) -> JobPage {
        let mem = self.mem.read().unwrap_or_else(|e| e.into_inner());
        let mut jobs: Vec<Job> = mem
            .values()
            .filter(|job| pipeline_id.map_or(true, |p| job.pipeline_id == p))
            .filter(|job| statuses.is_empty() || statuses.contains(&job.status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = if opts.include_total {
            Some(jobs.len() as i64)
        } else {
            None
        };
        let jobs = jobs
            .into_iter()
            .skip(opts.offset.max(0) as usize)
            .take(opts.limit.max(0) as usize)
            .collect();
        JobPage { jobs, total }
    }

    /// Per-status tallies for one pipeline.
    pub async fn counts(&self, pipeline_id: &str) -> Result<StatusCounts> {
        if !self.is_degraded() && self.is_initialized() {
            match self.counts_from_sql(pipeline_id).await {
                Ok(counts) => return Ok(counts),
                Err(e) => warn!(error = %e, "counting from disk failed; serving from memory"),
            }
        }
        Ok(self.counts_from_memory(pipeline_id))
    }

    async fn counts_from_sql(&self, pipeline_id: &str) -> Result<StatusCounts> {
        let pool = self.pool.get().ok_or_else(|| anyhow!("not initialized"))?;
        let rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM jobs WHERE pipeline_id = ? GROUP BY status")
                .bind(pipeline_id)
                .fetch_all(pool)
                .await?;
        let mut counts = StatusCounts::default();
        for row in &rows {
            let raw: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            if let Some(status) = JobStatus::parse(&raw) {
                counts.bump(status, n);
            }
        }
        Ok(counts)
    }

    fn counts_from_memory(&self, pipeline_id: &str) -> StatusCounts {
        let mem = self.mem.read().unwrap_or_else(|e| e.into_inner());
        let mut counts = StatusCounts::default();
        for job in mem.values().filter(|j| j.pipeline_id == pipeline_id) {
            counts.bump(job.status, 1);
        }
        counts
    }

    /// Most recent job for a pipeline by creation time.
    pub async fn last(&self, pipeline_id: &str) -> Result<Option<Job>> {
        let page = self
            .list(
                pipeline_id,
                &ListOptions {
                    limit: 1,
                    ..Default::default()
                },
            )
            .await?;
        Ok(page.jobs.into_iter().next())
    }

    /// Per-pipeline tallies plus the most recent completion time.
    pub async fn pipeline_stats(&self) -> Result<Vec<PipelineStats>> {
        if !self.is_degraded() && self.is_initialized() {
            match self.pipeline_stats_from_sql().await {
                Ok(stats) => return Ok(stats),
                Err(e) => warn!(error = %e, "pipeline stats from disk failed; serving from memory"),
            }
        }
        Ok(self.pipeline_stats_from_memory())
    }

    async fn pipeline_stats_from_sql(&self) -> Result<Vec<PipelineStats>> {
        let pool = self.pool.get().ok_or_else(|| anyhow!("not initialized"))?;
        let rows = sqlx::query(
            "SELECT pipeline_id, COUNT(*) AS total, \
             SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed, \
             SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed, \
             MAX(completed_at) AS last_completed_at \
             FROM jobs GROUP BY pipeline_id ORDER BY pipeline_id",
        )
        .fetch_all(pool)
        .await?;
        let mut stats = Vec::with_capacity(rows.len());
        for row in &rows {
            stats.push(PipelineStats {
                pipeline_id: row.try_get("pipeline_id")?,
                total: row.try_get("total")?,
                completed: row.try_get("completed")?,
                failed: row.try_get("failed")?,
                last_completed_at: row
                    .try_get::<Option<i64>, _>("last_completed_at")?
                    .and_then(DateTime::from_timestamp_millis),
            });
        }
        Ok(stats)
    }

    fn pipeline_stats_from_memory(&self) -> Vec<PipelineStats> {
        let mem = self.mem.read().unwrap_or_else(|e| e.into_inner());
        let mut by_pipeline: HashMap<String, PipelineStats> = HashMap::new();
        for job in mem.values() {
            let entry = by_pipeline
                .entry(job.pipeline_id.clone())
                .or_insert_with(|| PipelineStats {
                    pipeline_id: job.pipeline_id.clone(),
                    total: 0,
                    completed: 0,
                    failed: 0,
                    last_completed_at: None,
                });
            entry.total += 1;
            match job.status {
                JobStatus::Completed => entry.completed += 1,
                JobStatus::Failed => entry.failed += 1,
                _ => {}
            }
            if job.completed_at > entry.last_completed_at {
                entry.last_completed_at = job.completed_at;
            }
        }
        let mut stats: Vec<PipelineStats> = by_pipeline.into_values().collect();
        stats.sort_by(|a, b| a.pipeline_id.cmp(&b.pipeline_id));
        stats
    }

    /// Import a batch inside one transaction. Rows with invalid ids are
    /// skipped with an error entry; existing ids count as skipped; the rest
    /// still commit.
    pub async fn bulk_import(&self, jobs: &[Job]) -> Result<BulkImportReport> {
        let mut report = BulkImportReport::default();

        if self.is_degraded() || !self.is_initialized() {
            let mut imported = Vec::new();
            {
                let mut mem = self.mem.write().unwrap_or_else(|e| e.into_inner());
                for job in jobs {
                    if !Job::is_valid_id(&job.id) {
                        report.errors.push(format!("invalid job id {:?}", job.id));
                        continue;
                    }
                    if mem.contains_key(&job.id) {
                        report.skipped += 1;
                        continue;
                    }
                    mem.insert(job.id.clone(), job.clone());
                    imported.push(job.id.clone());
                }
            }
            for id in &imported {
                self.enqueue_write(id);
            }
            report.imported = imported.len();
            return Ok(report);
        }

        let pool = self.pool.get().ok_or_else(|| anyhow!("not initialized"))?;
        let mut tx = pool.begin().await?;
        let mut imported = Vec::new();
        for job in jobs {
            if !Job::is_valid_id(&job.id) {
                report.errors.push(format!("invalid job id {:?}", job.id));
                continue;
            }
            match save_query(IMPORT_SQL, job).execute(&mut *tx).await {
                Ok(outcome) if outcome.rows_affected() == 1 => imported.push(job.clone()),
                Ok(_) => report.skipped += 1,
                Err(e) => report
                    .errors
                    .push(format!("importing job {:?} failed: {e}", job.id)),
            }
        }
        tx.commit().await?;

        {
            let mut mem = self.mem.write().unwrap_or_else(|e| e.into_inner());
            for job in &imported {
                mem.insert(job.id.clone(), job.clone());
            }
        }
        report.imported = imported.len();
        Ok(report)
    }

    pub fn health(&self) -> StoreHealth {
        let initialized = self.is_initialized();
        let (degraded, persist_failures, recovery_attempts, recovery_exhausted, queued, staleness) = {
            let dur = self.durability.lock().unwrap_or_else(|e| e.into_inner());
            (
                dur.degraded,
                dur.persist_failures,
                dur.recovery_attempts,
                dur.recovery_exhausted,
                dur.write_queue.len(),
                dur.write_queue
                    .front()
                    .map(|w| (Utc::now() - w.timestamp).num_milliseconds()),
            )
        };
        let db_size_bytes = std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);

        let status = if !initialized {
            "not_initialized"
        } else if degraded {
            "degraded"
        } else {
            "healthy"
        };
        let message = if !initialized {
            "store has not been initialized".to_string()
        } else if degraded && recovery_exhausted {
            "degraded; recovery attempts exhausted".to_string()
        } else if degraded {
            format!("degraded; {queued} queued writes awaiting recovery")
        } else {
            "ok".to_string()
        };

        StoreHealth {
            status: status.to_string(),
            db_path: self.db_path.display().to_string(),
            db_size_bytes,
            queued_writes: queued,
            queue_staleness_ms: staleness,
            memory_pressure: if db_size_bytes > MEMORY_PRESSURE_BYTES {
                "high".to_string()
            } else {
                "normal".to_string()
            },
            persist_failure_count: persist_failures,
            recovery_attempts,
            message,
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_persist_failures(&self, n: u32) {
        self.injected_persist_failures
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_injected_fault(&self) -> bool {
        use std::sync::atomic::Ordering;
        loop {
            let current = self.injected_persist_failures.load(Ordering::SeqCst);
            if current == 0 {
                return false;
            }
            if self
                .injected_persist_failures
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }
}

fn push_write(queue: &mut VecDeque<QueuedWrite>, id: &str) {
    if queue.len() >= MAX_QUEUED_WRITES {
        queue.pop_front();
        warn!("write queue full; evicted oldest pending write");
    }
    queue.push_back(QueuedWrite {
        id: id.to_string(),
        timestamp: Utc::now(),
    });
}

fn recovery_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    RECOVERY_BASE_DELAY
        .saturating_mul(factor)
        .min(RECOVERY_MAX_DELAY)
}

fn status_filter(opts: &ListOptions) -> Vec<JobStatus> {
    if let Some(status) = opts.status {
        return vec![status];
    }
    match opts.tab.as_deref() {
        Some("failed") => vec![JobStatus::Failed, JobStatus::Cancelled],
        Some("active") => vec![JobStatus::Queued, JobStatus::Running, JobStatus::Paused],
        Some("completed") => vec![JobStatus::Completed],
        Some(other) => {
            warn!(tab = other, "ignoring unknown jobs tab");
            Vec::new()
        }
        None => Vec::new(),
    }
}

fn build_where(with_pipeline: bool, statuses: &[JobStatus]) -> String {
    let mut clauses = Vec::new();
    if with_pipeline {
        clauses.push("pipeline_id = ?".to_string());
    }
    if !statuses.is_empty() {
        // Status strings come from the enum; safe to inline.
        let list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        clauses.push(format!("status IN ({list})"));
    }
    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}

type SqliteQuery = sqlx::query::Query<'static, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'static>>;

fn save_query(sql: &'static str, job: &Job) -> SqliteQuery {
    sqlx::query(sql)
        .bind(job.id.clone())
        .bind(job.pipeline_id.clone())
        .bind(job.status.as_str())
        .bind(job.created_at.timestamp_millis())
        .bind(job.started_at.map(|t| t.timestamp_millis()))
        .bind(job.completed_at.map(|t| t.timestamp_millis()))
        .bind(job.data.as_ref().map(|v| v.to_string()))
        .bind(job.result.as_ref().map(|v| v.to_string()))
        .bind(
            job.error
                .as_ref()
                .and_then(|e| serde_json::to_string(e).ok()),
        )
        .bind(job.retry_count as i64)
        .bind(if job.git.is_empty() {
            None
        } else {
            serde_json::to_string(&job.git).ok()
        })
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let id: String = row.try_get("id")?;
    let status_raw: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("unknown status {status_raw:?} for job {id}"))?;
    let created_at = DateTime::from_timestamp_millis(row.try_get::<i64, _>("created_at")?)
        .ok_or_else(|| anyhow!("unreadable created_at for job {id}"))?;

    Ok(Job {
        pipeline_id: row.try_get("pipeline_id")?,
        status,
        created_at,
        started_at: row
            .try_get::<Option<i64>, _>("started_at")?
            .and_then(DateTime::from_timestamp_millis),
        completed_at: row
            .try_get::<Option<i64>, _>("completed_at")?
            .and_then(DateTime::from_timestamp_millis),
        paused_at: None,
        resumed_at: None,
        data: parse_json_column(&id, "data", row.try_get("data")?),
        result: parse_json_column(&id, "result", row.try_get("result")?),
        error: parse_error_column(&id, row.try_get("error")?),
        retry_count: row.try_get::<i64, _>("retry_count")?.max(0) as u32,
        retry_pending: false,
        git: parse_git_column(&id, row.try_get("git")?),
        id,
    })
}

/// Tolerant parse of historical JSON data; malformed values become `None`
/// with a warning instead of a crash.
fn parse_json_column(id: &str, column: &str, raw: Option<String>) -> Option<serde_json::Value> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(job_id = %id, column, error = %e, "malformed JSON in job store");
            None
        }
    }
}

fn parse_error_column(id: &str, raw: Option<String>) -> Option<JobFailure> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(job_id = %id, column = "error", error = %e, "malformed JSON in job store");
            None
        }
    }
}

fn parse_git_column(id: &str, raw: Option<String>) -> GitInfo {
    let Some(raw) = raw else {
        return GitInfo::default();
    };
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(job_id = %id, column = "git", error = %e, "malformed JSON in job store");
            GitInfo::default()
        }
    }
}
