//! Telemetry sink abstraction.
//!
//! The engine reports failures and breadcrumbs through a sink so the
//! transport (tracing, an APM agent, a test collector) stays swappable. Sink
//! invocations are guarded: a panicking sink must never take a job down with
//! it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::failure::JobFailure;

pub trait TelemetrySink: Send + Sync {
    /// Record a failure with its origin component.
    fn capture_failure(&self, origin: &str, failure: &JobFailure);

    /// Record an informational breadcrumb.
    fn breadcrumb(&self, origin: &str, message: &str);
}

/// Default sink backed by the tracing subscriber.
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn capture_failure(&self, origin: &str, failure: &JobFailure) {
        error!(
            origin,
            code = failure.code.as_deref(),
            http_status = failure.http_status,
            "{}",
            failure.message
        );
    }

    fn breadcrumb(&self, origin: &str, message: &str) {
        debug!(origin, "{message}");
    }
}

/// Guarded handle around a sink.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    pub fn capture_failure(&self, origin: &str, failure: &JobFailure) {
        let guarded = catch_unwind(AssertUnwindSafe(|| {
            self.sink.capture_failure(origin, failure);
        }));
        if guarded.is_err() {
            warn!(origin, "telemetry sink panicked while capturing a failure");
        }
    }

    pub fn breadcrumb(&self, origin: &str, message: &str) {
        let guarded = catch_unwind(AssertUnwindSafe(|| {
            self.sink.breadcrumb(origin, message);
        }));
        if guarded.is_err() {
            warn!(origin, "telemetry sink panicked while recording a breadcrumb");
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(Arc::new(TracingTelemetry))
    }
}
