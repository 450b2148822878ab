//! Job model for pipeline runs.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::kernel::failure::JobFailure;

lazy_static! {
    // Path-traversal-safe, injection-safe identifier.
    static ref JOB_ID: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,100}$").expect("job id pattern is valid");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl JobStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Paused => "paused",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "paused" => Some(JobStatus::Paused),
            _ => None,
        }
    }
}

/// Git workflow metadata, populated only when the workflow ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_files: Vec<String>,
}

impl GitInfo {
    pub fn is_empty(&self) -> bool {
        self.branch_name.is_none()
            && self.original_branch.is_none()
            && self.commit_sha.is_none()
            && self.pr_url.is_none()
            && self.changed_files.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub pipeline_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    #[serde(default)]
    pub retry_count: u32,
    /// True iff a retry timer is armed for this job. In-memory latch only.
    #[serde(skip)]
    pub retry_pending: bool,
    #[serde(default, skip_serializing_if = "GitInfo::is_empty")]
    pub git: GitInfo,
}

impl Job {
    /// Construct a freshly queued job.
    pub fn queued(
        id: impl Into<String>,
        pipeline_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            pipeline_id: pipeline_id.into(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            paused_at: None,
            resumed_at: None,
            data,
            result: None,
            error: None,
            retry_count: 0,
            retry_pending: false,
            git: GitInfo::default(),
        }
    }

    pub fn is_valid_id(id: &str) -> bool {
        JOB_ID.is_match(id)
    }

    /// Strip anything outside `[A-Za-z0-9_-]` so an id can double as a
    /// filename without traversal risk.
    pub fn sanitized_id(id: &str) -> String {
        id.chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .take(100)
            .collect()
    }

    /// Wall-clock duration of the run, when both endpoints are known.
    pub fn duration_ms(&self) -> Option<u64> {
        let (started, completed) = (self.started_at?, self.completed_at?);
        (completed - started).num_milliseconds().try_into().ok()
    }
}
