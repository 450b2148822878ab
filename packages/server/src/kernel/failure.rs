//! Concrete failure type shared across the job engine.
//!
//! Handlers, the store, the git engine, and the secrets layer all surface
//! errors as [`JobFailure`] so the classifier can key on structured fields
//! instead of scraping display strings.

use serde::{Deserialize, Serialize};

/// A failure with richer-than-string semantics.
///
/// `code` holds an errno-style identifier (`ETIMEDOUT`, `ENOENT`, ...);
/// `http_status` is set when the failure originated from an HTTP exchange;
/// `stack` carries the cause chain when one exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct JobFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            http_status: None,
            stack: None,
            cancelled: false,
        }
    }

    /// A cooperative-cancellation marker failure.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            cancelled: true,
            ..Self::new(message)
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl From<anyhow::Error> for JobFailure {
    fn from(err: anyhow::Error) -> Self {
        // {:?} renders the full cause chain.
        let stack = format!("{err:?}");
        JobFailure::new(err.to_string()).with_stack(stack)
    }
}

impl From<std::io::Error> for JobFailure {
    fn from(err: std::io::Error) -> Self {
        let failure = JobFailure::new(err.to_string());
        match errno_code(err.kind()) {
            Some(code) => failure.with_code(code),
            None => failure,
        }
    }
}

/// Map an [`std::io::ErrorKind`] onto the errno-style codes the classifier
/// understands.
fn errno_code(kind: std::io::ErrorKind) -> Option<&'static str> {
    use std::io::ErrorKind::*;
    match kind {
        NotFound => Some("ENOENT"),
        PermissionDenied => Some("EACCES"),
        AlreadyExists => Some("EEXIST"),
        InvalidInput => Some("EINVAL"),
        TimedOut => Some("ETIMEDOUT"),
        ConnectionRefused => Some("ECONNREFUSED"),
        ConnectionReset => Some("ECONNRESET"),
        BrokenPipe => Some("EPIPE"),
        WouldBlock => Some("EAGAIN"),
        _ => None,
    }
}
