//! Per-job log directory writer.
//!
//! Successful jobs land as `<dir>/<sanitised-id>.json`; failures as
//! `<dir>/<sanitised-id>.error.json`. Ids are sanitised before use as
//! filenames.

use std::path::PathBuf;

use anyhow::{Context, Result};

use super::job::Job;

#[derive(Debug, Clone)]
pub struct JobLogWriter {
    dir: PathBuf,
}

impl JobLogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn write_success(&self, job: &Job) -> Result<()> {
        self.write(job, "json").await
    }

    pub async fn write_failure(&self, job: &Job) -> Result<()> {
        self.write(job, "error.json").await
    }

    async fn write(&self, job: &Job, extension: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating log directory {}", self.dir.display()))?;
        let name = Job::sanitized_id(&job.id);
        let path = self.dir.join(format!("{name}.{extension}"));
        let body = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("writing job log {}", path.display()))?;
        Ok(())
    }
}
