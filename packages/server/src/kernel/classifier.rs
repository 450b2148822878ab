//! Failure classification for retry decisions.
//!
//! [`classify`] is a total function: every failure yields a verdict. The
//! phases are checked in priority order — error code, HTTP status, message
//! patterns — and within the message phase non-retryable patterns win, so
//! "not found" can never be shadowed by a coincidental "timeout" substring.

use std::time::Duration;

use lazy_static::lazy_static;
use regex::RegexSet;

use super::failure::JobFailure;

/// The verdict for a single failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
    pub reason: String,
    pub delay: Duration,
}

impl Classification {
    fn retry(reason: impl Into<String>, delay: Duration) -> Self {
        Self {
            retryable: true,
            reason: reason.into(),
            delay,
        }
    }

    fn terminal(reason: impl Into<String>) -> Self {
        Self {
            retryable: false,
            reason: reason.into(),
            delay: Duration::ZERO,
        }
    }
}

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
const TIMEOUT_RETRY_DELAY: Duration = Duration::from_secs(10);
const MESSAGE_RETRY_DELAY: Duration = Duration::from_secs(10);
const HTTP_408_DELAY: Duration = Duration::from_secs(30);
const HTTP_429_DELAY: Duration = Duration::from_secs(60);
const HTTP_5XX_DELAY: Duration = Duration::from_secs(15);

const NON_RETRYABLE_CODES: &[&str] = &[
    "ENOENT",
    "ENOTDIR",
    "EISDIR",
    "EACCES",
    "EPERM",
    "EINVAL",
    "EEXIST",
    "ENOTFOUND",
    "ECONNREFUSED",
    "ERR_MODULE_NOT_FOUND",
];

const RETRYABLE_CODES: &[&str] = &[
    "ETIMEDOUT",
    "ECONNRESET",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "EPIPE",
    "EAGAIN",
    "EBUSY",
];

lazy_static! {
    static ref NON_RETRYABLE_MESSAGES: RegexSet = RegexSet::new([
        r"(?i)invalid.*argument",
        r"(?i)validation.*failed",
        r"(?i)not found",
        r"(?i)does not exist",
        r"(?i)permission denied",
        r"(?i)unauthorized",
        r"(?i)forbidden",
        r"(?i)bad request",
        r"(?i)malformed",
    ])
    .expect("non-retryable message patterns are valid");
    static ref RETRYABLE_MESSAGES: RegexSet = RegexSet::new([
        r"(?i)timeout",
        r"(?i)timed out",
        r"(?i)connection.*reset",
        r"(?i)temporarily unavailable",
        r"(?i)service unavailable",
        r"(?i)internal server error",
    ])
    .expect("retryable message patterns are valid");
}

/// Classify a failure as retryable or terminal, with a suggested delay.
pub fn classify(failure: &JobFailure) -> Classification {
    if let Some(code) = failure.code.as_deref() {
        if let Some(verdict) = classify_code(code) {
            return verdict;
        }
    }

    if let Some(status) = failure.http_status {
        if let Some(verdict) = classify_http_status(status) {
            return verdict;
        }
    }

    if NON_RETRYABLE_MESSAGES.is_match(&failure.message) {
        return Classification::terminal("message matched a non-retryable pattern");
    }
    if RETRYABLE_MESSAGES.is_match(&failure.message) {
        return Classification::retry(
            "message matched a transient-failure pattern",
            MESSAGE_RETRY_DELAY,
        );
    }

    // Unknown failures do not loop; surfacing beats retrying blind.
    Classification::terminal("unclassified failure")
}

fn classify_code(code: &str) -> Option<Classification> {
    if NON_RETRYABLE_CODES.contains(&code) {
        return Some(Classification::terminal(format!(
            "non-retryable error code {code}"
        )));
    }
    if RETRYABLE_CODES.contains(&code) {
        let delay = if code == "ETIMEDOUT" {
            TIMEOUT_RETRY_DELAY
        } else {
            DEFAULT_RETRY_DELAY
        };
        return Some(Classification::retry(
            format!("retryable error code {code}"),
            delay,
        ));
    }
    None
}

fn classify_http_status(status: u16) -> Option<Classification> {
    match status {
        408 => Some(Classification::retry(
            "http 408 request timeout",
            HTTP_408_DELAY,
        )),
        429 => Some(Classification::retry("http 429 rate limited", HTTP_429_DELAY)),
        400..=499 => Some(Classification::terminal(format!(
            "http {status} client error"
        ))),
        500..=599 => Some(Classification::retry(
            format!("http {status} server error"),
            HTTP_5XX_DELAY,
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_retryable_code_wins() {
        let verdict = classify(&JobFailure::new("open failed").with_code("ENOENT"));
        assert!(!verdict.retryable);
        assert!(verdict.reason.contains("ENOENT"));
    }

    #[test]
    fn timeout_code_gets_longer_delay() {
        let verdict = classify(&JobFailure::new("slow").with_code("ETIMEDOUT"));
        assert!(verdict.retryable);
        assert_eq!(verdict.delay, Duration::from_secs(10));
    }

    #[test]
    fn retryable_code_default_delay() {
        let verdict = classify(&JobFailure::new("reset").with_code("ECONNRESET"));
        assert!(verdict.retryable);
        assert_eq!(verdict.delay, Duration::from_secs(5));
    }

    #[test]
    fn code_takes_priority_over_message() {
        // The message alone would be retryable, but the code is terminal.
        let verdict = classify(&JobFailure::new("timeout while opening").with_code("ENOENT"));
        assert!(!verdict.retryable);
    }

    #[test]
    fn http_408_and_429_delays() {
        let v408 = classify(&JobFailure::new("slow").with_http_status(408));
        assert!(v408.retryable);
        assert_eq!(v408.delay, Duration::from_secs(30));

        let v429 = classify(&JobFailure::new("limited").with_http_status(429));
        assert!(v429.retryable);
        assert_eq!(v429.delay, Duration::from_secs(60));
    }

    #[test]
    fn http_4xx_is_terminal_5xx_retries() {
        assert!(!classify(&JobFailure::new("nope").with_http_status(404)).retryable);

        let v500 = classify(&JobFailure::new("boom").with_http_status(500));
        assert!(v500.retryable);
        assert_eq!(v500.delay, Duration::from_secs(15));
    }

    #[test]
    fn non_retryable_message_checked_before_retryable() {
        // "not found" must win even though "timeout" also appears.
        let verdict = classify(&JobFailure::new("resource not found after timeout"));
        assert!(!verdict.retryable);
    }

    #[test]
    fn retryable_message_patterns() {
        for message in [
            "operation timed out",
            "connection was reset by peer",
            "service unavailable",
            "Internal Server Error",
        ] {
            let verdict = classify(&JobFailure::new(message));
            assert!(verdict.retryable, "{message:?} should be retryable");
            assert_eq!(verdict.delay, Duration::from_secs(10));
        }
    }

    #[test]
    fn validation_failed_is_terminal() {
        assert!(!classify(&JobFailure::new("validation failed")).retryable);
    }

    #[test]
    fn default_is_terminal() {
        let verdict = classify(&JobFailure::new("some novel explosion"));
        assert!(!verdict.retryable);
        assert_eq!(verdict.reason, "unclassified failure");
    }

    #[test]
    fn always_returns_a_valid_classification() {
        // A sweep over assorted shapes; every result must be well-formed.
        let failures = vec![
            JobFailure::new(""),
            JobFailure::new("x").with_code("TOTALLY_UNKNOWN"),
            JobFailure::new("y").with_http_status(302),
            JobFailure::new("z").with_code("EBUSY").with_http_status(500),
        ];
        for failure in failures {
            let verdict = classify(&failure);
            assert!(!verdict.reason.is_empty());
        }
    }
}
