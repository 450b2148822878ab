pub mod activity_ws;
pub mod health;
pub mod pipelines;
pub mod scans;
pub mod status;

pub use activity_ws::activity_ws_handler;
pub use health::health_handler;
pub use pipelines::{list_pipeline_jobs, trigger_pipeline};
pub use scans::start_scan;
pub use status::status_handler;
