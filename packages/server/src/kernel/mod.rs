//! Kernel-level infrastructure: the job lifecycle engine and the services
//! around it. Business payloads stay behind the handler seam; HTTP lives in
//! `server`.

pub mod activity;
pub mod classifier;
pub mod config;
pub mod cron;
pub mod failure;
pub mod git;
pub mod jobs;
pub mod secrets;
pub mod telemetry;

pub use activity::{ActivityEvent, ActivityStream};
pub use config::Config;
pub use failure::JobFailure;
pub use telemetry::{Telemetry, TelemetrySink, TracingTelemetry};
