//! Job infrastructure: the lifecycle engine and everything it leans on.
//!
//! - [`Job`] — the central model, persisted as history forever
//! - [`JobStore`] — SQLite-backed durable table with a degraded-mode queue
//! - [`JobScheduler`] — queue, concurrency cap, retry state machine
//! - [`WorkerRegistry`] — pipeline id → scheduler
//! - [`JobLogWriter`] — per-job log directory
//!
//! Pipeline payloads stay behind the [`JobHandler`] seam; business logic
//! does not live here.

pub mod events;
pub mod handlers;
mod job;
mod logs;
mod registry;
mod scheduler;
mod store;

pub use events::JobEvent;
pub use job::{GitInfo, Job, JobStatus};
pub use logs::JobLogWriter;
pub use registry::{RegistryError, WorkerDefaults, WorkerRegistry, SUPPORTED_PIPELINES};
pub use scheduler::{
    handler_fn, JobContext, JobHandler, JobScheduler, SchedulerConfig, SchedulerError,
    SchedulerStats, RETRY_CIRCUIT_BREAKER,
};
pub use store::{
    BulkImportReport, JobPage, JobStore, ListOptions, PipelineStats, StatusCounts, StoreHealth,
    MAX_PERSIST_FAILURES, MAX_QUEUED_WRITES, MAX_RECOVERY_ATTEMPTS,
};
