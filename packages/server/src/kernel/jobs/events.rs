//! Job lifecycle events.
//!
//! These are facts about transitions, not commands. The scheduler emits them
//! on a broadcast channel; the activity stream (and anything else) subscribes
//! and translates.

use super::job::Job;

#[derive(Debug, Clone)]
pub enum JobEvent {
    Created {
        job: Job,
    },
    Started {
        job: Job,
    },
    Completed {
        job: Job,
        duration_ms: u64,
    },
    Failed {
        job: Job,
    },
    Cancelled {
        job: Job,
    },
    Paused {
        job: Job,
    },
    Resumed {
        job: Job,
    },
    RetryScheduled {
        job: Job,
        attempt: u32,
        max_attempts: u32,
        reason: String,
        delay_ms: u64,
    },
}

impl JobEvent {
    /// The wire name used on the activity stream.
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Created { .. } => "job:created",
            JobEvent::Started { .. } => "job:started",
            JobEvent::Completed { .. } => "job:completed",
            JobEvent::Failed { .. } => "job:failed",
            JobEvent::Cancelled { .. } => "job:cancelled",
            JobEvent::Paused { .. } => "job:paused",
            JobEvent::Resumed { .. } => "job:resumed",
            JobEvent::RetryScheduled { .. } => "retry:created",
        }
    }

    pub fn job(&self) -> &Job {
        match self {
            JobEvent::Created { job }
            | JobEvent::Started { job }
            | JobEvent::Completed { job, .. }
            | JobEvent::Failed { job }
            | JobEvent::Cancelled { job }
            | JobEvent::Paused { job }
            | JobEvent::Resumed { job }
            | JobEvent::RetryScheduled { job, .. } => job,
        }
    }
}
