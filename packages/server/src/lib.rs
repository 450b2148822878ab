// Sidequest job server.
//
// A persistent job scheduling and execution server for batch operations
// against local source-code repositories: cron and API submission, bounded
// concurrency, WAL-backed persistence with crash recovery, failure
// classification and retries, an optional git branch/commit/push/PR workflow
// per job, and a WebSocket activity stream for the dashboard.

pub mod kernel;
pub mod server;

pub use kernel::config::Config;
