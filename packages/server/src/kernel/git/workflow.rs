//! Per-job git workflow: branch, detect, commit, push, PR, cleanup.
//!
//! Everything shells out to the `git` binary (and `gh` for pull requests),
//! one invocation at a time per repository. Dry-run replaces commit/push/PR
//! with synthetic values and always cleans up.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use crate::kernel::failure::JobFailure;

pub const DRY_RUN_PREFIX: &str = "dry-run-";

#[derive(Debug, Clone, TypedBuilder)]
pub struct GitWorkflowConfig {
    #[builder(default = "main".to_string(), setter(into))]
    pub base_branch: String,
    #[builder(default = "automated".to_string(), setter(into))]
    pub branch_prefix: String,
    #[builder(default = false)]
    pub dry_run: bool,
}

impl Default for GitWorkflowConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Generates commit messages and PR content. Injected so pipelines can
/// describe their changes in their own words.
pub trait ChangeDescriber: Send + Sync {
    fn commit_message(&self, job_type: &str, job_id: &str) -> String {
        format!("{job_type}: automated changes from job {job_id}")
    }

    fn pr_title(&self, job_type: &str, job_id: &str) -> String {
        format!("Automated {job_type} changes ({job_id})")
    }

    fn pr_body(&self, job_type: &str, job_id: &str, changed_files: &[String]) -> String {
        let mut body = format!("Automated changes produced by {job_type} job `{job_id}`.\n\nFiles:\n");
        for file in changed_files {
            body.push_str("- ");
            body.push_str(file);
            body.push('\n');
        }
        body
    }

    fn pr_labels(&self) -> Vec<String> {
        vec!["automated".to_string()]
    }
}

pub struct DefaultChangeDescriber;

impl ChangeDescriber for DefaultChangeDescriber {}

/// The branch pair captured when a workflow starts.
#[derive(Debug, Clone)]
pub struct BranchContext {
    pub branch: String,
    pub original_branch: String,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowOutcome {
    pub changed_files: Vec<String>,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
    pub cleaned_up: bool,
}

pub struct GitWorkflowEngine {
    config: GitWorkflowConfig,
    describer: Arc<dyn ChangeDescriber>,
}

impl GitWorkflowEngine {
    pub fn new(config: GitWorkflowConfig) -> Self {
        Self {
            config,
            describer: Arc::new(DefaultChangeDescriber),
        }
    }

    pub fn with_describer(mut self, describer: Arc<dyn ChangeDescriber>) -> Self {
        self.describer = describer;
        self
    }

    pub fn config(&self) -> &GitWorkflowConfig {
        &self.config
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> Result<String, JobFailure> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .output()
            .await
            .map_err(JobFailure::from)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(JobFailure::new(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn current_branch(&self, repo: &Path) -> Result<String, JobFailure> {
        self.git(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    /// Capture the current branch and check out a fresh job branch.
    pub async fn prepare_branch(
        &self,
        repo: &Path,
        job_type: &str,
        job_id: &str,
    ) -> Result<BranchContext, JobFailure> {
        let original_branch = self.current_branch(repo).await?;
        let branch = format!(
            "{}/{}/{}-{}",
            self.config.branch_prefix,
            job_type,
            job_id,
            Utc::now().timestamp()
        );
        self.git(repo, &["checkout", "-b", &branch]).await?;
        debug!(%branch, %original_branch, "created job branch");
        Ok(BranchContext {
            branch,
            original_branch,
        })
    }

    /// List files with uncommitted changes.
    pub async fn detect_changes(&self, repo: &Path) -> Result<Vec<String>, JobFailure> {
        let status = self.git(repo, &["status", "--porcelain"]).await?;
        Ok(status
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| line[3..].trim().to_string())
            .collect())
    }

    /// Drive detect → commit → push → PR after a successful handler run.
    ///
    /// Push failure stops before the PR with a warning; PR failure is
    /// reported but neither is fatal.
    pub async fn finish(
        &self,
        repo: &Path,
        job_type: &str,
        job_id: &str,
        ctx: &BranchContext,
    ) -> Result<WorkflowOutcome, JobFailure> {
        let changed_files = self.detect_changes(repo).await?;

        if self.config.dry_run {
            let outcome = WorkflowOutcome {
                changed_files,
                commit_sha: Some(format!("{DRY_RUN_PREFIX}{}", ctx.branch)),
                pr_url: Some(format!("{DRY_RUN_PREFIX}{}", ctx.branch)),
                cleaned_up: true,
            };
            self.cleanup(repo, ctx).await?;
            return Ok(outcome);
        }

        if changed_files.is_empty() {
            debug!(branch = %ctx.branch, "no changes detected; cleaning up");
            self.cleanup(repo, ctx).await?;
            return Ok(WorkflowOutcome {
                cleaned_up: true,
                ..Default::default()
            });
        }

        self.git(repo, &["add", "-A"]).await?;
        let message = self.describer.commit_message(job_type, job_id);
        self.git(repo, &["commit", "-m", &message]).await?;
        let commit_sha = self.git(repo, &["rev-parse", "HEAD"]).await?;

        let mut outcome = WorkflowOutcome {
            changed_files,
            commit_sha: Some(commit_sha),
            pr_url: None,
            cleaned_up: false,
        };

        if let Err(e) = self
            .git(repo, &["push", "-u", "origin", &ctx.branch])
            .await
        {
            warn!(branch = %ctx.branch, error = %e, "push failed; skipping pull request");
            return Ok(outcome);
        }

        match self
            .open_pr(repo, job_type, job_id, &ctx.branch, &outcome.changed_files)
            .await
        {
            Ok(url) => outcome.pr_url = Some(url),
            Err(e) => warn!(branch = %ctx.branch, error = %e, "opening pull request failed"),
        }
        Ok(outcome)
    }

    async fn open_pr(
        &self,
        repo: &Path,
        job_type: &str,
        job_id: &str,
        branch: &str,
        changed_files: &[String],
    ) -> Result<String, JobFailure> {
        let title = self.describer.pr_title(job_type, job_id);
        let body = self.describer.pr_body(job_type, job_id, changed_files);
        let labels = self.describer.pr_labels().join(",");
        let mut command = Command::new("gh");
        command
            .arg("pr")
            .arg("create")
            .arg("--base")
            .arg(&self.config.base_branch)
            .arg("--head")
            .arg(branch)
            .arg("--title")
            .arg(&title)
            .arg("--body")
            .arg(&body)
            .current_dir(repo);
        if !labels.is_empty() {
            command.arg("--label").arg(&labels);
        }
        let output = command.output().await.map_err(JobFailure::from)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(JobFailure::new(format!(
                "gh pr create failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Return to the original branch and delete the job branch.
    pub async fn cleanup(&self, repo: &Path, ctx: &BranchContext) -> Result<(), JobFailure> {
        self.git(repo, &["checkout", &ctx.original_branch]).await?;
        self.git(repo, &["branch", "-D", &ctx.branch]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn run_git(repo: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .status()
            .await
            .expect("git runs");
        assert!(status.success(), "git {args:?} failed");
    }

    /// A repo with one commit on `main` and identity configured.
    async fn init_repo(dir: &TempDir) {
        let repo = dir.path();
        run_git(repo, &["init", "-b", "main"]).await;
        run_git(repo, &["config", "user.email", "jobs@example.com"]).await;
        run_git(repo, &["config", "user.name", "Sidequest"]).await;
        std::fs::write(repo.join("README.md"), "# fixture\n").unwrap();
        run_git(repo, &["add", "-A"]).await;
        run_git(repo, &["commit", "-m", "initial"]).await;
    }

    fn engine(dry_run: bool) -> GitWorkflowEngine {
        GitWorkflowEngine::new(GitWorkflowConfig::builder().dry_run(dry_run).build())
    }

    #[tokio::test]
    async fn prepare_branch_captures_original() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir).await;
        let engine = engine(false);

        let ctx = engine
            .prepare_branch(dir.path(), "cleanup", "job-1")
            .await
            .unwrap();
        assert_eq!(ctx.original_branch, "main");
        assert!(ctx.branch.starts_with("automated/cleanup/job-1-"));
        assert_eq!(engine.current_branch(dir.path()).await.unwrap(), ctx.branch);
    }

    #[tokio::test]
    async fn detect_changes_lists_dirty_files() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir).await;
        let engine = engine(false);

        assert!(engine.detect_changes(dir.path()).await.unwrap().is_empty());

        std::fs::write(dir.path().join("new.txt"), "hello").unwrap();
        let changed = engine.detect_changes(dir.path()).await.unwrap();
        assert_eq!(changed, vec!["new.txt".to_string()]);
    }

    #[tokio::test]
    async fn no_changes_cleans_up_without_commit() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir).await;
        let engine = engine(false);

        let ctx = engine
            .prepare_branch(dir.path(), "cleanup", "job-1")
            .await
            .unwrap();
        let outcome = engine
            .finish(dir.path(), "cleanup", "job-1", &ctx)
            .await
            .unwrap();

        assert!(outcome.cleaned_up);
        assert!(outcome.commit_sha.is_none());
        assert!(outcome.pr_url.is_none());
        assert_eq!(engine.current_branch(dir.path()).await.unwrap(), "main");
    }

    #[tokio::test]
    async fn dry_run_synthesises_values_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir).await;
        let engine = engine(true);

        let ctx = engine
            .prepare_branch(dir.path(), "cleanup", "job-1")
            .await
            .unwrap();
        std::fs::write(dir.path().join("generated.txt"), "out").unwrap();
        let outcome = engine
            .finish(dir.path(), "cleanup", "job-1", &ctx)
            .await
            .unwrap();

        assert!(outcome.pr_url.unwrap().starts_with(DRY_RUN_PREFIX));
        assert!(outcome.commit_sha.unwrap().starts_with(DRY_RUN_PREFIX));
        assert!(outcome.cleaned_up);
        assert_eq!(engine.current_branch(dir.path()).await.unwrap(), "main");
    }

    #[tokio::test]
    async fn commit_without_remote_stops_before_pr() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir).await;
        let engine = engine(false);

        let ctx = engine
            .prepare_branch(dir.path(), "cleanup", "job-1")
            .await
            .unwrap();
        std::fs::write(dir.path().join("generated.txt"), "out").unwrap();
        let outcome = engine
            .finish(dir.path(), "cleanup", "job-1", &ctx)
            .await
            .unwrap();

        // The commit landed; push failed (no origin) so no PR, and that is
        // not an error.
        assert!(outcome.commit_sha.is_some());
        assert!(!outcome.commit_sha.unwrap().starts_with(DRY_RUN_PREFIX));
        assert!(outcome.pr_url.is_none());
        assert_eq!(outcome.changed_files, vec!["generated.txt".to_string()]);
    }

    #[test]
    fn default_describer_message_shape() {
        let describer = DefaultChangeDescriber;
        assert_eq!(
            describer.commit_message("gitignore-update", "job-9"),
            "gitignore-update: automated changes from job job-9"
        );
        assert!(!describer.pr_labels().is_empty());
    }
}
