//! Activity stream: a bounded ring of recent lifecycle events with fan-out
//! to live subscribers.
//!
//! Subscribers hang off a broadcast channel; a slow or dead subscriber lags
//! and skips, it never blocks `add`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use super::jobs::{JobEvent, JobScheduler};
use super::telemetry::Telemetry;

pub const DEFAULT_CAPACITY: usize = 200;
const CHANNEL_CAPACITY: usize = 256;

/// Fallback message when a failure event carries no error details.
const NO_ERROR_DETAILS: &str = "Job failed with no error details";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Monotone per-stream id.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub icon: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// Event fields before the stream stamps id and timestamp.
#[derive(Debug, Clone, Default)]
pub struct NewActivity {
    pub kind: String,
    pub job_id: Option<String>,
    pub status: Option<String>,
    pub icon: String,
    pub message: String,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub attempt: Option<u32>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityStats {
    /// Cumulative count of events ever added.
    pub total: u64,
    pub by_type: HashMap<String, u64>,
    pub newest: Option<DateTime<Utc>>,
    pub oldest: Option<DateTime<Utc>>,
    pub last_hour: usize,
}

struct Ring {
    entries: VecDeque<ActivityEvent>,
    next_id: u64,
    total: u64,
}

pub struct ActivityStream {
    ring: Mutex<Ring>,
    tx: broadcast::Sender<serde_json::Value>,
    capacity: usize,
    telemetry: Telemetry,
}

impl ActivityStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                next_id: 1,
                total: 0,
            }),
            tx,
            capacity,
            telemetry: Telemetry::default(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Stamp, store, trim, and fan out. Fan-out trouble never aborts the add.
    pub fn add(&self, partial: NewActivity) -> ActivityEvent {
        let event = {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            let event = ActivityEvent {
                id: ring.next_id,
                timestamp: Utc::now(),
                kind: partial.kind,
                job_id: partial.job_id,
                status: partial.status,
                icon: partial.icon,
                message: partial.message,
                error: partial.error,
                duration_ms: partial.duration_ms,
                attempt: partial.attempt,
                max_attempts: partial.max_attempts,
            };
            ring.next_id += 1;
            ring.total += 1;
            ring.entries.push_front(event.clone());
            ring.entries.truncate(self.capacity);
            event
        };

        match serde_json::to_value(&event) {
            Ok(activity) => {
                let payload = serde_json::json!({"type": "activity:new", "activity": activity});
                // Send only errors when there are no subscribers.
                let _ = self.tx.send(payload);
            }
            Err(e) => {
                self.telemetry
                    .breadcrumb("activity", &format!("activity fan-out failed: {e}"));
            }
        }
        event
    }

    /// Live feed of `{type:"activity:new", activity}` payloads.
    pub fn subscribe(&self) -> broadcast::Receiver<serde_json::Value> {
        self.tx.subscribe()
    }

    /// Newest-first slice of the ring.
    pub fn recent(&self, n: usize) -> Vec<ActivityEvent> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.entries.iter().take(n).cloned().collect()
    }

    pub fn stats(&self) -> ActivityStats {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let mut by_type: HashMap<String, u64> = HashMap::new();
        for event in &ring.entries {
            *by_type.entry(event.kind.clone()).or_default() += 1;
        }
        let hour_ago = Utc::now() - Duration::hours(1);
        ActivityStats {
            total: ring.total,
            by_type,
            newest: ring.entries.front().map(|e| e.timestamp),
            oldest: ring.entries.back().map(|e| e.timestamp),
            last_hour: ring
                .entries
                .iter()
                .filter(|e| e.timestamp >= hour_ago)
                .count(),
        }
    }

    /// Subscribe to a scheduler's lifecycle emissions and translate each into
    /// an activity entry.
    pub fn listen_to_worker(self: Arc<Self>, scheduler: &JobScheduler) {
        let mut rx = scheduler.subscribe();
        let stream = self;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        stream.add(translate(&event));
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "activity listener lagged behind scheduler events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Default for ActivityStream {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn translate(event: &JobEvent) -> NewActivity {
    let job = event.job();
    let base = NewActivity {
        kind: event.kind().to_string(),
        job_id: Some(job.id.clone()),
        status: Some(job.status.as_str().to_string()),
        ..Default::default()
    };

    match event {
        JobEvent::Created { job } => NewActivity {
            icon: "📋".to_string(),
            message: format!("Job {} queued on {}", job.id, job.pipeline_id),
            ..base
        },
        JobEvent::Started { job } => NewActivity {
            icon: "🚀".to_string(),
            message: format!("Job {} started", job.id),
            ..base
        },
        JobEvent::Completed { job, duration_ms } => NewActivity {
            icon: "✅".to_string(),
            message: format!("Job {} completed", job.id),
            duration_ms: Some(*duration_ms),
            ..base
        },
        JobEvent::Failed { job } => NewActivity {
            icon: "❌".to_string(),
            message: format!("Job {} failed", job.id),
            error: Some(
                job.error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| NO_ERROR_DETAILS.to_string()),
            ),
            ..base
        },
        JobEvent::Cancelled { job } => NewActivity {
            icon: "🚫".to_string(),
            message: format!("Job {} cancelled", job.id),
            ..base
        },
        JobEvent::Paused { job } => NewActivity {
            icon: "⏸️".to_string(),
            message: format!("Job {} paused", job.id),
            ..base
        },
        JobEvent::Resumed { job } => NewActivity {
            icon: "▶️".to_string(),
            message: format!("Job {} resumed", job.id),
            ..base
        },
        JobEvent::RetryScheduled {
            job,
            attempt,
            max_attempts,
            reason,
            delay_ms,
        } => NewActivity {
            icon: "🔄".to_string(),
            message: format!(
                "Retry {attempt}/{max_attempts} for job {} in {delay_ms} ms: {reason}",
                job.id
            ),
            attempt: Some(*attempt),
            max_attempts: Some(*max_attempts),
            ..base
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::failure::JobFailure;
    use crate::kernel::jobs::Job;

    fn entry(kind: &str) -> NewActivity {
        NewActivity {
            kind: kind.to_string(),
            icon: "📋".to_string(),
            message: "test".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn ids_are_monotone_and_ring_is_bounded() {
        let stream = ActivityStream::new(3);
        for _ in 0..5 {
            stream.add(entry("job:created"));
        }
        let recent = stream.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].id, 5);
        assert_eq!(recent[1].id, 4);
        assert_eq!(recent[2].id, 3);
    }

    #[test]
    fn stats_count_types_and_totals() {
        let stream = ActivityStream::new(10);
        stream.add(entry("job:created"));
        stream.add(entry("job:created"));
        stream.add(entry("job:failed"));

        let stats = stream.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type["job:created"], 2);
        assert_eq!(stats.by_type["job:failed"], 1);
        assert_eq!(stats.last_hour, 3);
        assert!(stats.newest >= stats.oldest);
    }

    #[tokio::test]
    async fn add_fans_out_to_subscribers() {
        let stream = ActivityStream::new(10);
        let mut rx = stream.subscribe();
        stream.add(entry("job:started"));

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload["type"], "activity:new");
        assert_eq!(payload["activity"]["type"], "job:started");
    }

    #[test]
    fn add_without_subscribers_is_fine() {
        let stream = ActivityStream::new(10);
        let event = stream.add(entry("job:created"));
        assert_eq!(event.id, 1);
    }

    #[test]
    fn failed_event_without_details_is_normalised() {
        let mut job = Job::queued("job-1", "p", None);
        job.error = None;
        let activity = translate(&JobEvent::Failed { job });
        assert_eq!(activity.error.as_deref(), Some("Job failed with no error details"));
    }

    #[test]
    fn failed_event_with_details_keeps_message() {
        let mut job = Job::queued("job-1", "p", None);
        job.error = Some(JobFailure::new("disk on fire"));
        let activity = translate(&JobEvent::Failed { job });
        assert_eq!(activity.error.as_deref(), Some("disk on fire"));
    }

    #[test]
    fn retry_translation_carries_attempt_counters() {
        let job = Job::queued("job-1", "p", None);
        let activity = translate(&JobEvent::RetryScheduled {
            job,
            attempt: 2,
            max_attempts: 5,
            reason: "retryable error code ETIMEDOUT".to_string(),
            delay_ms: 10_000,
        });
        assert_eq!(activity.kind, "retry:created");
        assert_eq!(activity.icon, "🔄");
        assert_eq!(activity.attempt, Some(2));
        assert_eq!(activity.max_attempts, Some(5));
        assert!(activity.message.contains("10000 ms"));
    }
}
