//! Filtering and batching of refactor suggestions into automated PRs.
//!
//! Suggestions flow in from analysis pipelines; only the ones that are both
//! automatable and impactful enough get applied, in batches small enough to
//! review, one branch/commit/PR per batch.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::kernel::failure::JobFailure;

use super::workflow::GitWorkflowEngine;

pub const MIN_IMPACT_SCORE: u32 = 50;
pub const DEFAULT_MAX_SUGGESTIONS_PER_PR: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefactorSuggestion {
    pub file: String,
    pub description: String,
    #[serde(default)]
    pub automated_refactor_possible: bool,
    #[serde(default)]
    pub impact_score: u32,
}

/// Applies a batch of suggestions to the working tree. Opaque to the
/// batcher; dry runs never invoke it.
#[async_trait::async_trait]
pub trait SuggestionApplier: Send + Sync {
    async fn apply(&self, repo: &Path, batch: &[RefactorSuggestion]) -> Result<(), JobFailure>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub pr_urls: Vec<String>,
    pub errors: Vec<String>,
    pub filtered_out: usize,
    pub batches: usize,
}

pub struct SuggestionBatcher {
    engine: Arc<GitWorkflowEngine>,
    applier: Option<Arc<dyn SuggestionApplier>>,
    max_per_pr: usize,
}

impl SuggestionBatcher {
    pub fn new(engine: Arc<GitWorkflowEngine>) -> Self {
        Self {
            engine,
            applier: None,
            max_per_pr: DEFAULT_MAX_SUGGESTIONS_PER_PR,
        }
    }

    pub fn with_applier(mut self, applier: Arc<dyn SuggestionApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    pub fn with_max_per_pr(mut self, max_per_pr: usize) -> Self {
        self.max_per_pr = max_per_pr.max(1);
        self
    }

    /// Retain suggestions that are automatable and score at least
    /// [`MIN_IMPACT_SCORE`].
    pub fn filter(suggestions: Vec<RefactorSuggestion>) -> Vec<RefactorSuggestion> {
        suggestions
            .into_iter()
            .filter(|s| s.automated_refactor_possible && s.impact_score >= MIN_IMPACT_SCORE)
            .collect()
    }

    /// Run the full pipeline: filter, batch, and one branch/commit/PR per
    /// batch. Per-batch errors are collected, not fatal.
    pub async fn process(
        &self,
        repo: &Path,
        job_type: &str,
        job_id: &str,
        suggestions: Vec<RefactorSuggestion>,
    ) -> BatchReport {
        let total = suggestions.len();
        let eligible = Self::filter(suggestions);
        let mut report = BatchReport {
            filtered_out: total - eligible.len(),
            ..Default::default()
        };

        for (index, batch) in eligible.chunks(self.max_per_pr).enumerate() {
            report.batches += 1;
            let batch_id = format!("{job_id}-batch-{}", index + 1);

            let ctx = match self.engine.prepare_branch(repo, job_type, &batch_id).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    report
                        .errors
                        .push(format!("batch {batch_id}: branch creation failed: {e}"));
                    continue;
                }
            };

            if !self.engine.config().dry_run {
                if let Some(applier) = &self.applier {
                    if let Err(e) = applier.apply(repo, batch).await {
                        report
                            .errors
                            .push(format!("batch {batch_id}: applying suggestions failed: {e}"));
                        if let Err(cleanup) = self.engine.cleanup(repo, &ctx).await {
                            warn!(batch = %batch_id, error = %cleanup, "batch cleanup failed");
                        }
                        continue;
                    }
                }
            }

            match self.engine.finish(repo, job_type, &batch_id, &ctx).await {
                Ok(outcome) => {
                    if let Some(url) = outcome.pr_url {
                        report.pr_urls.push(url);
                    }
                }
                Err(e) => {
                    report
                        .errors
                        .push(format!("batch {batch_id}: workflow failed: {e}"));
                    if let Err(cleanup) = self.engine.cleanup(repo, &ctx).await {
                        warn!(batch = %batch_id, error = %cleanup, "batch cleanup failed");
                    }
                }
            }
        }

        info!(
            batches = report.batches,
            prs = report.pr_urls.len(),
            errors = report.errors.len(),
            "suggestion batching finished"
        );
        report
    }
}
